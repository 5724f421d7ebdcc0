use std::collections::BTreeMap;
use std::path::Path;
use std::{fmt, fs, io, str};
use thiserror::Error;

/// A bencoded value. Dictionaries are ordered by raw key bytes, which makes
/// re-encoding canonical by construction.
#[derive(Ord, PartialOrd, Eq, PartialEq, Debug, Clone)]
pub enum Element {
    Integer(i64),
    ByteString(Vec<u8>),
    List(Vec<Element>),
    Dictionary(BTreeMap<Element, Element>),
}

/// Nesting deeper than this is rejected to bound decoder stack usage.
const MAX_DEPTH: usize = 256;

impl Element {
    /// Decode exactly one value from `src`. Canonical form is enforced:
    /// unsorted or duplicate dictionary keys, redundant leading zeros and
    /// bytes after the top-level value are all rejected.
    pub fn from_bytes(src: &[u8]) -> Result<Element, ParseError> {
        let (element, rest) = read_element(src, 0)?;
        if rest.is_empty() {
            Ok(element)
        } else {
            Err(ParseError::TrailingGarbage)
        }
    }

    /// Read and decode a bencoded file.
    pub fn from_file(path: impl AsRef<Path>) -> io::Result<Element> {
        let content = fs::read(path)?;
        Ok(Self::from_bytes(&content)?)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        let mut dest = Vec::<u8>::new();
        self.encode_into(&mut dest).unwrap();
        dest
    }

    /// Emit the canonical encoding into `dest` without materializing an
    /// intermediate buffer. Used to feed the info dictionary straight into
    /// a hasher.
    pub fn encode_into<W: io::Write>(&self, dest: &mut W) -> io::Result<()> {
        match self {
            Element::Integer(number) => {
                write!(dest, "{}{}{}", PREFIX_INTEGER as char, number, SUFFIX_COMMON as char)?;
            }
            Element::ByteString(data) => {
                write!(dest, "{}{}", data.len(), DELIMITER_STRING as char)?;
                dest.write_all(data)?;
            }
            Element::List(list) => {
                dest.write_all(&[PREFIX_LIST])?;
                for e in list {
                    e.encode_into(dest)?;
                }
                dest.write_all(&[SUFFIX_COMMON])?;
            }
            Element::Dictionary(map) => {
                dest.write_all(&[PREFIX_DICTIONARY])?;
                for (key, value) in map {
                    key.encode_into(dest)?;
                    value.encode_into(dest)?;
                }
                dest.write_all(&[SUFFIX_COMMON])?;
            }
        }
        Ok(())
    }
}

impl From<&str> for Element {
    fn from(text: &str) -> Self {
        Element::ByteString(Vec::<u8>::from(text))
    }
}

impl From<String> for Element {
    fn from(text: String) -> Self {
        Element::ByteString(text.into_bytes())
    }
}

impl From<i64> for Element {
    fn from(number: i64) -> Self {
        Element::Integer(number)
    }
}

impl From<Vec<u8>> for Element {
    fn from(data: Vec<u8>) -> Self {
        Element::ByteString(data)
    }
}

#[derive(Debug, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("malformed input: {0}")]
    Malformed(&'static str),
    #[error("dictionary keys are not unique and sorted")]
    NonCanonical,
    #[error("input ends before the value is complete")]
    Truncated,
    #[error("integer literal exceeds the signed 64-bit range")]
    Overflow,
    #[error("trailing bytes after the top-level value")]
    TrailingGarbage,
}

impl From<ParseError> for io::Error {
    fn from(e: ParseError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, e)
    }
}

/// Convert a decoded dictionary into one keyed by UTF-8 strings, dropping
/// entries whose keys aren't valid UTF-8.
pub fn convert_dictionary(src: BTreeMap<Element, Element>) -> BTreeMap<String, Element> {
    fn to_string_key(pair: (Element, Element)) -> Option<(String, Element)> {
        let (key, value) = pair;
        match key {
            Element::ByteString(data) => match String::from_utf8(data) {
                Ok(text) => Some((text, value)),
                Err(_) => None,
            },
            _ => None,
        }
    }
    src.into_iter().filter_map(to_string_key).collect()
}

const DELIMITER_STRING: u8 = b':';
const PREFIX_INTEGER: u8 = b'i';
const PREFIX_LIST: u8 = b'l';
const PREFIX_DICTIONARY: u8 = b'd';
const SUFFIX_COMMON: u8 = b'e';

fn read_element(src: &[u8], depth: usize) -> Result<(Element, &[u8]), ParseError> {
    if depth > MAX_DEPTH {
        return Err(ParseError::Malformed("nesting too deep"));
    }
    let first_byte = src.first().ok_or(ParseError::Truncated)?;
    match *first_byte {
        b'0'..=b'9' => read_string(src),
        PREFIX_INTEGER => read_integer(src),
        PREFIX_LIST => read_list(src, depth),
        PREFIX_DICTIONARY => read_dictionary(src, depth),
        _ => Err(ParseError::Malformed("invalid value prefix")),
    }
}

fn split_once(src: &[u8], delimiter: u8) -> Option<(&[u8], &[u8])> {
    let index = src.iter().position(|b| *b == delimiter)?;
    Some((&src[..index], &src[index + 1..]))
}

/// Parse an ASCII decimal with the canonical-form restrictions: at least one
/// digit, no leading zeros except for a literal `0`, and no `-0`.
fn parse_decimal(text: &[u8], allow_negative: bool) -> Result<i64, ParseError> {
    let (negative, digits) = match text.split_first() {
        Some((b'-', rest)) if allow_negative => (true, rest),
        _ => (false, text),
    };
    if digits.is_empty() {
        return Err(ParseError::Malformed("number without digits"));
    }
    if !digits.iter().all(u8::is_ascii_digit) {
        return Err(ParseError::Malformed("non-digit in number"));
    }
    if digits[0] == b'0' && (digits.len() > 1 || negative) {
        return Err(ParseError::Malformed("redundant leading zero or -0"));
    }
    let mut value = 0i64;
    for digit in digits {
        let digit = (digit - b'0') as i64;
        value = value
            .checked_mul(10)
            .and_then(|v| if negative { v.checked_sub(digit) } else { v.checked_add(digit) })
            .ok_or(ParseError::Overflow)?;
    }
    Ok(value)
}

fn read_integer(src: &[u8]) -> Result<(Element, &[u8]), ParseError> {
    let rest = &src[1..]; // strip 'i'
    let (number_data, rest) = split_once(rest, SUFFIX_COMMON).ok_or(ParseError::Truncated)?;
    let number = parse_decimal(number_data, true)?;
    Ok((Element::Integer(number), rest))
}

fn read_string(src: &[u8]) -> Result<(Element, &[u8]), ParseError> {
    let (size_data, rest) = split_once(src, DELIMITER_STRING).ok_or(ParseError::Truncated)?;
    let size = parse_decimal(size_data, false)? as usize;

    if rest.len() < size {
        return Err(ParseError::Truncated);
    }
    let (data, rest) = rest.split_at(size);
    Ok((Element::ByteString(Vec::from(data)), rest))
}

fn read_list(src: &[u8], depth: usize) -> Result<(Element, &[u8]), ParseError> {
    let mut rest = &src[1..]; // strip 'l'

    let mut list = Vec::new();
    loop {
        match rest.first() {
            None => return Err(ParseError::Truncated),
            Some(&SUFFIX_COMMON) => break,
            Some(_) => {
                let (element, new_rest) = read_element(rest, depth + 1)?;
                list.push(element);
                rest = new_rest;
            }
        }
    }
    Ok((Element::List(list), &rest[1..]))
}

fn read_dictionary(src: &[u8], depth: usize) -> Result<(Element, &[u8]), ParseError> {
    let mut rest = &src[1..]; // strip 'd'

    let mut map = BTreeMap::new();
    let mut prev_key: Option<Vec<u8>> = None;
    loop {
        match rest.first() {
            None => return Err(ParseError::Truncated),
            Some(&SUFFIX_COMMON) => break,
            Some(b) if b.is_ascii_digit() => (),
            Some(_) => return Err(ParseError::Malformed("dictionary key is not a string")),
        }
        let (key, new_rest) = read_string(rest)?;
        rest = new_rest;

        let (value, new_rest) = read_element(rest, depth + 1)?;
        rest = new_rest;

        if let Element::ByteString(key_bytes) = &key {
            if let Some(prev) = &prev_key {
                if *prev >= *key_bytes {
                    return Err(ParseError::NonCanonical);
                }
            }
            prev_key = Some(key_bytes.clone());
        }
        map.insert(key, value);
    }
    Ok((Element::Dictionary(map), &rest[1..]))
}

impl fmt::Display for Element {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt_element(self, f, 0)
    }
}

fn fmt_element(e: &Element, f: &mut fmt::Formatter<'_>, depth: usize) -> fmt::Result {
    match e {
        Element::Integer(number) => write!(f, "{number}"),
        Element::ByteString(data) => match str::from_utf8(data) {
            Ok(text) if !text.contains(char::is_control) => write!(f, "\"{text}\""),
            _ => write!(f, "<{} bytes>", data.len()),
        },
        Element::List(list) => {
            write!(f, "[ ")?;
            for (i, item) in list.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                fmt_element(item, f, depth + 1)?;
            }
            write!(f, " ]")
        }
        Element::Dictionary(map) => {
            let pad = "  ".repeat(depth + 1);
            writeln!(f, "{{")?;
            for (key, value) in map {
                write!(f, "{pad}")?;
                fmt_element(key, f, depth + 1)?;
                write!(f, ": ")?;
                fmt_element(value, f, depth + 1)?;
                writeln!(f)?;
            }
            write!(f, "{}}}", "  ".repeat(depth))
        }
    }
}
