//! Host interpreter values.
//!
//! Values are dynamically typed and every value has a string form; numeric,
//! list and dict views are derived from that form on demand, the way a
//! string-based scripting host treats its values.

use std::fmt;

use crate::error::{AlienError, Result};

const MESSAGE_VALUE_LIMIT: usize = 100;

#[derive(Debug, Clone, PartialEq, Default)]
pub enum Value {
    #[default]
    Empty,
    Int(i64),
    /// Unsigned values that do not fit an `i64`.
    Wide(u64),
    Double(f64),
    Str(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    /// Insertion ordered key/value pairs.
    Dict(Vec<(String, Value)>),
    Pointer(PointerValue),
}

/// A native address together with its type tag.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PointerValue {
    pub address: usize,
    pub tag: Option<String>,
}

impl PointerValue {
    pub fn new(address: usize, tag: Option<&str>) -> Self {
        Self {
            address,
            tag: tag.map(str::to_string),
        }
    }

    pub fn null(tag: Option<&str>) -> Self {
        Self::new(0, tag)
    }

    pub fn is_null(&self) -> bool {
        self.address == 0
    }

    pub fn as_ptr(&self) -> *mut u8 {
        self.address as *mut u8
    }

    /// Parses `0x<hex>^<tag>`, `0x<hex>` or a plain integer address.
    pub fn parse(text: &str) -> Option<Self> {
        let text = text.trim();
        let (addr, tag) = match text.split_once('^') {
            Some((addr, tag)) => (addr, Some(tag)),
            None => (text, None),
        };
        let address = if let Some(hex) =
            addr.strip_prefix("0x").or_else(|| addr.strip_prefix("0X"))
        {
            usize::from_str_radix(hex, 16).ok()?
        } else {
            addr.parse::<usize>().ok()?
        };
        let tag = tag.filter(|t| !t.is_empty());
        Some(Self::new(address, tag))
    }
}

impl fmt::Display for PointerValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let width = 2 * size_of::<usize>();
        write!(f, "0x{:0width$x}^", self.address)?;
        if let Some(tag) = &self.tag {
            f.write_str(tag)?;
        }
        Ok(())
    }
}

impl Value {
    pub fn list(items: impl IntoIterator<Item = Value>) -> Self {
        Self::List(items.into_iter().collect())
    }

    pub fn dict<K: Into<String>>(
        pairs: impl IntoIterator<Item = (K, Value)>,
    ) -> Self {
        Self::Dict(pairs.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }

    pub fn from_i128(value: i128) -> Self {
        if let Ok(v) = i64::try_from(value) {
            Self::Int(v)
        } else if let Ok(v) = u64::try_from(value) {
            Self::Wide(v)
        } else {
            unreachable!("native integers never exceed 64 bits")
        }
    }

    pub fn is_empty_string(&self) -> bool {
        match self {
            Self::Empty => true,
            Self::Str(s) => s.is_empty(),
            Self::Bytes(b) => b.is_empty(),
            Self::List(items) => items.is_empty(),
            Self::Dict(pairs) => pairs.is_empty(),
            _ => false,
        }
    }

    pub fn as_integer(&self) -> Result<i128> {
        match self {
            Self::Int(v) => Ok(*v as i128),
            Self::Wide(v) => Ok(*v as i128),
            Self::Str(s) => {
                parse_integer(s).ok_or_else(|| AlienError::wrong_type("integer", self))
            }
            Self::List(items) if items.len() == 1 => items[0].as_integer(),
            _ => Err(AlienError::wrong_type("integer", self)),
        }
    }

    pub fn as_double(&self) -> Result<f64> {
        match self {
            Self::Int(v) => Ok(*v as f64),
            Self::Wide(v) => Ok(*v as f64),
            Self::Double(v) => Ok(*v),
            Self::Str(s) => {
                let t = s.trim();
                t.parse::<f64>()
                    .ok()
                    .or_else(|| parse_integer(t).map(|v| v as f64))
                    .ok_or_else(|| AlienError::wrong_type("floating point number", self))
            }
            _ => Err(AlienError::wrong_type("floating point number", self)),
        }
    }

    pub fn as_bool(&self) -> Result<bool> {
        match self {
            Self::Str(s) => match s.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" | "on" => Ok(true),
                "0" | "false" | "no" | "off" => Ok(false),
                _ => Err(AlienError::wrong_type("boolean", self)),
            },
            _ => Ok(self.as_integer()? != 0),
        }
    }

    pub fn as_list(&self) -> Result<Vec<Value>> {
        match self {
            Self::Empty => Ok(Vec::new()),
            Self::List(items) => Ok(items.clone()),
            Self::Dict(pairs) => Ok(pairs
                .iter()
                .flat_map(|(k, v)| [Value::Str(k.clone()), v.clone()])
                .collect()),
            Self::Str(s) => Ok(parse_list(s)?.into_iter().map(Value::Str).collect()),
            other => Ok(vec![other.clone()]),
        }
    }

    pub fn as_dict(&self) -> Result<Vec<(String, Value)>> {
        match self {
            Self::Dict(pairs) => Ok(pairs.clone()),
            _ => {
                let items = self.as_list()?;
                if items.len() % 2 != 0 {
                    return Err(AlienError::wrong_type("dictionary", self));
                }
                Ok(items
                    .chunks(2)
                    .map(|kv| (kv[0].to_string(), kv[1].clone()))
                    .collect())
            }
        }
    }

    pub fn as_bytes(&self) -> Vec<u8> {
        match self {
            Self::Bytes(b) => b.clone(),
            other => other.to_string().into_bytes(),
        }
    }

    pub fn as_pointer(&self) -> Result<PointerValue> {
        match self {
            Self::Pointer(p) => Ok(p.clone()),
            Self::Int(v) if *v >= 0 => Ok(PointerValue::new(*v as usize, None)),
            Self::Wide(v) => Ok(PointerValue::new(*v as usize, None)),
            Self::Str(s) => PointerValue::parse(s)
                .ok_or_else(|| AlienError::wrong_type("pointer", self)),
            _ => Err(AlienError::wrong_type("pointer", self)),
        }
    }

    /// Looks up `key` in the dict view of the value.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self {
            Self::Dict(pairs) => lookup(pairs, key).cloned(),
            _ => self.as_dict().ok().and_then(|d| lookup(&d, key).cloned()),
        }
    }

    /// String form bounded in length, for error messages.
    pub fn to_string_lossy_short(&self) -> String {
        let s = self.to_string();
        if s.chars().count() <= MESSAGE_VALUE_LIMIT {
            return s;
        }
        let mut out: String = s.chars().take(MESSAGE_VALUE_LIMIT).collect();
        out.push_str("...");
        out
    }
}

pub fn lookup<'a>(pairs: &'a [(String, Value)], key: &str) -> Option<&'a Value> {
    pairs.iter().find(|(k, _)| k == key).map(|(_, v)| v)
}

/// Parses decimal, `0x` hex, `0o` octal and `0b` binary integer literals
/// with an optional sign.
pub fn parse_integer(text: &str) -> Option<i128> {
    let t = text.trim();
    let (negative, digits) = match t.as_bytes().first()? {
        b'-' => (true, &t[1..]),
        b'+' => (false, &t[1..]),
        _ => (false, t),
    };
    let (radix, digits) = match digits.get(..2) {
        Some("0x") | Some("0X") => (16, &digits[2..]),
        Some("0o") | Some("0O") => (8, &digits[2..]),
        Some("0b") | Some("0B") => (2, &digits[2..]),
        _ => (10, digits),
    };
    if digits.is_empty() || digits.starts_with(['+', '-']) {
        return None;
    }
    let magnitude = i128::from_str_radix(digits, radix).ok()?;
    Some(if negative { -magnitude } else { magnitude })
}

/// Splits a brace/quote aware list string into its elements.
pub fn parse_list(text: &str) -> Result<Vec<String>> {
    let chars: Vec<char> = text.chars().collect();
    let mut items = Vec::new();
    let mut i = 0;
    while i < chars.len() {
        while i < chars.len() && chars[i].is_whitespace() {
            i += 1;
        }
        if i >= chars.len() {
            break;
        }
        let mut item = String::new();
        match chars[i] {
            '{' => {
                let mut depth = 1;
                i += 1;
                while i < chars.len() {
                    match chars[i] {
                        '{' => depth += 1,
                        '}' => {
                            depth -= 1;
                            if depth == 0 {
                                break;
                            }
                        }
                        '\\' if i + 1 < chars.len() => {
                            item.push('\\');
                            i += 1;
                        }
                        _ => {}
                    }
                    item.push(chars[i]);
                    i += 1;
                }
                if depth != 0 {
                    return Err(AlienError::invalid(format!(
                        "Unmatched open brace in list \"{text}\"."
                    )));
                }
                i += 1;
                if i < chars.len() && !chars[i].is_whitespace() {
                    return Err(AlienError::invalid(format!(
                        "List element in braces followed by \"{}\" instead of space.",
                        chars[i]
                    )));
                }
            }
            '"' => {
                i += 1;
                while i < chars.len() && chars[i] != '"' {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                        item.push(unescape(chars[i]));
                    } else {
                        item.push(chars[i]);
                    }
                    i += 1;
                }
                if i >= chars.len() {
                    return Err(AlienError::invalid(format!(
                        "Unmatched open quote in list \"{text}\"."
                    )));
                }
                i += 1;
            }
            _ => {
                while i < chars.len() && !chars[i].is_whitespace() {
                    if chars[i] == '\\' && i + 1 < chars.len() {
                        i += 1;
                        item.push(unescape(chars[i]));
                    } else {
                        item.push(chars[i]);
                    }
                    i += 1;
                }
            }
        }
        items.push(item);
    }
    Ok(items)
}

fn unescape(c: char) -> char {
    match c {
        'n' => '\n',
        't' => '\t',
        'r' => '\r',
        '0' => '\0',
        other => other,
    }
}

fn needs_braces(element: &str) -> bool {
    element.is_empty()
        || element
            .chars()
            .any(|c| c.is_whitespace() || matches!(c, '{' | '}' | '"' | '\\' | ';' | '$' | '['))
}

fn write_element(f: &mut fmt::Formatter<'_>, element: &str) -> fmt::Result {
    if needs_braces(element) {
        write!(f, "{{{element}}}")
    } else {
        f.write_str(element)
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Empty => Ok(()),
            Self::Int(v) => write!(f, "{v}"),
            Self::Wide(v) => write!(f, "{v}"),
            Self::Double(v) => {
                if v.is_finite() && v.fract() == 0.0 && v.abs() < 1e16 {
                    write!(f, "{v:.1}")
                } else {
                    write!(f, "{v}")
                }
            }
            Self::Str(s) => f.write_str(s),
            Self::Bytes(b) => {
                for &byte in b {
                    write!(f, "{}", byte as char)?;
                }
                Ok(())
            }
            Self::List(items) => {
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write_element(f, &item.to_string())?;
                }
                Ok(())
            }
            Self::Dict(pairs) => {
                for (i, (k, v)) in pairs.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write_element(f, k)?;
                    f.write_str(" ")?;
                    write_element(f, &v.to_string())?;
                }
                Ok(())
            }
            Self::Pointer(p) => write!(f, "{p}"),
        }
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int(v as i64)
    }
}

impl From<u64> for Value {
    fn from(v: u64) -> Self {
        Self::from_i128(v as i128)
    }
}

impl From<usize> for Value {
    fn from(v: usize) -> Self {
        Self::from_i128(v as i128)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Double(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::Str(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::Str(v)
    }
}

impl From<Vec<Value>> for Value {
    fn from(v: Vec<Value>) -> Self {
        Self::List(v)
    }
}

impl From<PointerValue> for Value {
    fn from(v: PointerValue) -> Self {
        Self::Pointer(v)
    }
}
