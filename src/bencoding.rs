use std::collections::BTreeMap;

use thiserror::Error;

const LIST_INDICATOR: u8 = b'l';
const INT_INDICATOR: u8 = b'i';
const DICT_INDICATOR: u8 = b'd';
const END_INDICATOR: u8 = b'e';
const BYTES_INDICATOR: std::ops::RangeInclusive<u8> = b'0'..=b'9';

// lists and dicts nested deeper than this are refused. decoding recurses,
// so untrusted input must not pick the stack depth.
pub const MAX_DEPTH: usize = 256;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Bencode {
    Int(i64),
    List(Vec<Bencode>),
    Bytes(Vec<u8>),
    Dict(BTreeMap<Vec<u8>, Bencode>),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BencodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("invalid integer: {0}")]
    InvalidInteger(String),

    #[error("invalid byte string length")]
    InvalidStringLength,

    #[error("byte string of length {declared} exceeds remaining {remaining} bytes")]
    StringTooLong { declared: usize, remaining: usize },

    #[error("dictionary keys are not sorted")]
    UnsortedKeys,

    #[error("dictionary key is not a byte string")]
    InvalidKey,

    #[error("unexpected byte {0:#04x}")]
    UnexpectedByte(u8),

    #[error("{0} trailing bytes after value")]
    TrailingData(usize),

    #[error("values nested deeper than {0} levels")]
    TooDeep(usize),
}

impl Bencode {
    // render the value as json for the decode command.
    // byte strings that aren't utf-8 are replaced lossily.
    pub fn to_json(&self) -> serde_json::Value {
        match self {
            Bencode::Int(i) => serde_json::Value::from(*i),
            Bencode::Bytes(b) => serde_json::Value::String(String::from_utf8_lossy(b).into_owned()),
            Bencode::List(items) => {
                serde_json::Value::Array(items.iter().map(Bencode::to_json).collect())
            }
            Bencode::Dict(map) => {
                let object = map
                    .iter()
                    .map(|(k, v)| (String::from_utf8_lossy(k).into_owned(), v.to_json()))
                    .collect::<serde_json::Map<_, _>>();
                serde_json::Value::Object(object)
            }
        }
    }
}

impl From<&str> for Bencode {
    fn from(s: &str) -> Self {
        Bencode::Bytes(s.as_bytes().to_vec())
    }
}

pub mod encoder {
    use super::Bencode;

    // btreemap iteration is ordered, so dictionaries always come out with
    // sorted keys no matter how they were built
    pub fn encode(data: &Bencode) -> Vec<u8> {
        let mut out = Vec::new();
        encode_into(data, &mut out);
        out
    }

    fn encode_bytes(bytes: &[u8], out: &mut Vec<u8>) {
        out.extend(bytes.len().to_string().into_bytes());
        out.push(b':');
        out.extend_from_slice(bytes);
    }

    fn encode_into(data: &Bencode, out: &mut Vec<u8>) {
        match data {
            Bencode::Int(i) => out.extend(format!("i{}e", i).into_bytes()),
            Bencode::Bytes(b) => encode_bytes(b, out),
            Bencode::List(items) => {
                out.push(b'l');
                for item in items {
                    encode_into(item, out);
                }
                out.push(b'e');
            }
            Bencode::Dict(map) => {
                out.push(b'd');
                for (key, value) in map {
                    encode_bytes(key, out);
                    encode_into(value, out);
                }
                out.push(b'e');
            }
        }
    }
}

pub mod decoder {
    use super::{
        Bencode, BencodeError, BYTES_INDICATOR, DICT_INDICATOR, END_INDICATOR, INT_INDICATOR,
        LIST_INDICATOR, MAX_DEPTH,
    };
    use std::collections::BTreeMap;

    type Parsed<'a> = Result<(Bencode, &'a [u8]), BencodeError>;

    // input starts right after the 'i'
    fn parse_int(input: &[u8]) -> Parsed<'_> {
        let end = input
            .iter()
            .position(|&b| b == END_INDICATOR)
            .ok_or(BencodeError::UnexpectedEof)?;

        let num_str = std::str::from_utf8(&input[..end])
            .map_err(|_| BencodeError::InvalidInteger("not utf-8".to_string()))?;

        let digits = num_str.strip_prefix('-').unwrap_or(num_str);
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return Err(BencodeError::InvalidInteger(num_str.to_string()));
        }

        // only canonical integers are accepted so that re-encoding is exact
        if num_str == "-0" || (digits.starts_with('0') && digits.len() > 1) {
            return Err(BencodeError::InvalidInteger(num_str.to_string()));
        }

        let number = num_str
            .parse::<i64>()
            .map_err(|e| BencodeError::InvalidInteger(e.to_string()))?;

        Ok((Bencode::Int(number), &input[end + 1..]))
    }

    fn parse_bytes(input: &[u8]) -> Parsed<'_> {
        let colon_pos = input
            .iter()
            .position(|&x| x == b':')
            .ok_or(BencodeError::UnexpectedEof)?;

        let len_bytes = &input[..colon_pos];
        if len_bytes.is_empty() || !len_bytes.iter().all(u8::is_ascii_digit) {
            return Err(BencodeError::InvalidStringLength);
        }

        let length = std::str::from_utf8(len_bytes)
            .ok()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or(BencodeError::InvalidStringLength)?;

        let rest = &input[colon_pos + 1..];
        if rest.len() < length {
            return Err(BencodeError::StringTooLong {
                declared: length,
                remaining: rest.len(),
            });
        }

        Ok((Bencode::Bytes(rest[..length].to_vec()), &rest[length..]))
    }

    // input starts right after the 'l'
    fn parse_list(mut input: &[u8], depth: usize) -> Parsed<'_> {
        let mut items = Vec::new();

        while let Some(&b) = input.first() {
            if b == END_INDICATOR {
                return Ok((Bencode::List(items), &input[1..]));
            }

            let (item, rest) = parse_value(input, depth)?;
            items.push(item);
            input = rest;
        }

        Err(BencodeError::UnexpectedEof)
    }

    // input starts right after the 'd'. keys have to arrive in strictly
    // increasing byte order, duplicates included.
    fn parse_dict(mut input: &[u8], depth: usize) -> Parsed<'_> {
        let mut map: BTreeMap<Vec<u8>, Bencode> = BTreeMap::new();
        let mut last_key: Option<Vec<u8>> = None;

        while let Some(&b) = input.first() {
            if b == END_INDICATOR {
                return Ok((Bencode::Dict(map), &input[1..]));
            }

            if !BYTES_INDICATOR.contains(&b) {
                return Err(BencodeError::InvalidKey);
            }

            let (key, rest) = match parse_bytes(input)? {
                (Bencode::Bytes(k), rest) => (k, rest),
                _ => return Err(BencodeError::InvalidKey),
            };

            if let Some(prev) = &last_key {
                if key <= *prev {
                    return Err(BencodeError::UnsortedKeys);
                }
            }

            let (value, rest) = parse_value(rest, depth)?;
            input = rest;

            last_key = Some(key.clone());
            map.insert(key, value);
        }

        Err(BencodeError::UnexpectedEof)
    }

    // depth counts the lists and dicts already open around this value
    fn parse_value(input: &[u8], depth: usize) -> Parsed<'_> {
        match input.first() {
            Some(&LIST_INDICATOR | &DICT_INDICATOR) if depth >= MAX_DEPTH => {
                Err(BencodeError::TooDeep(MAX_DEPTH))
            }
            Some(&INT_INDICATOR) => parse_int(&input[1..]),
            Some(&LIST_INDICATOR) => parse_list(&input[1..], depth + 1),
            Some(&DICT_INDICATOR) => parse_dict(&input[1..], depth + 1),
            Some(&b) if BYTES_INDICATOR.contains(&b) => parse_bytes(input),
            Some(&b) => Err(BencodeError::UnexpectedByte(b)),
            None => Err(BencodeError::UnexpectedEof),
        }
    }

    // decodes one value from the front of input, returning it together
    // with the number of bytes it took up
    pub fn decode(input: &[u8]) -> Result<(Bencode, usize), BencodeError> {
        let (value, rest) = parse_value(input, 0)?;
        Ok((value, input.len() - rest.len()))
    }

    // like decode but the value has to cover the whole input
    pub fn decode_all(input: &[u8]) -> Result<Bencode, BencodeError> {
        let (value, consumed) = decode(input)?;
        if consumed != input.len() {
            return Err(BencodeError::TrailingData(input.len() - consumed));
        }
        Ok(value)
    }
}
