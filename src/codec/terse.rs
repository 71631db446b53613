//! The terse codec: one message per line, minimal punctuation.
//!
//! ```text
//! ping/12 host:"example.org" count:3     call of `ping` with id 12
//! log msg:"started"                      call without id, i.e. no reply expected
//! [12]:[0.25 1 'AAE=']                   reply to call 12
//! [12]! message:"boom" details:"..."     error reply to call 12
//! ```
//!
//! Values are integers and floats as bare numerals (a float always contains `.`, `e` or `E`),
//!  double-quoted strings with `\\`, `\"` and `\n` escaped, base64 byte strings in single quotes,
//!  lists `[a b]` and dicts `{k:v k2:v2}`. Dict keys that are not identifiers are quoted.
//!
//! Empty lines are ignored, so a bare `\n` works as a keepalive payload.

use std::collections::BTreeMap;
use std::fmt::Write;

use base64::Engine as _;
use tracing::{trace, warn};

use crate::codec::{Codec, CodecError, Decoded, Message, SecurityParams, Value};

pub const NAME: &str = "terse";

#[derive(Clone, Copy, Debug, Default)]
pub struct TerseCodec;

impl Codec for TerseCodec {
    fn name(&self) -> &'static str {
        NAME
    }

    fn encode(&self, message: &Message, security: Option<&SecurityParams>) -> Result<Vec<u8>, CodecError> {
        if security.is_some() {
            return Err(CodecError::SecurityUnsupported(NAME));
        }
        let mut out = String::new();
        encode_message(message, &mut out)?;
        Ok(out.into_bytes())
    }

    fn decode(&self, data: &[u8], security: Option<&SecurityParams>) -> Result<Decoded, CodecError> {
        if security.is_some() {
            return Err(CodecError::SecurityUnsupported(NAME));
        }

        let (complete, leftover) = match data.iter().rposition(|&b| b == b'\n') {
            Some(pos) => (&data[..pos], &data[pos + 1..]),
            None => (&[][..], data),
        };

        let mut messages = Vec::new();
        for line in complete.split(|&b| b == b'\n') {
            let line = line.strip_suffix(b"\r").unwrap_or(line);
            if line.is_empty() {
                continue;
            }
            match decode_line(line) {
                Ok(message) => {
                    trace!("decoded {:?}", message);
                    messages.push(message);
                }
                Err(e) => warn!("skipping malformed line {:?}: {}", String::from_utf8_lossy(line), e),
            }
        }

        Ok(Decoded {
            messages,
            leftover: leftover.to_vec(),
        })
    }
}

#[derive(Debug, thiserror::Error)]
#[error("{reason} at position {pos}")]
struct DecodeError {
    reason: String,
    pos: usize,
}

fn is_ident_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '_' || c == '.'
}

fn is_identifier(s: &str) -> bool {
    match s.chars().next() {
        Some(first) if first.is_ascii_alphabetic() || first == '_' => s.chars().all(is_ident_char),
        _ => false,
    }
}

fn encode_message(message: &Message, out: &mut String) -> Result<(), CodecError> {
    match message {
        Message::Call { method, params, id } => {
            if !is_identifier(method) {
                return Err(CodecError::Encode(format!("invalid method name {:?}", method)));
            }
            out.push_str(method);
            if *id != 0 {
                let _ = write!(out, "/{}", id);
            }
            for (key, value) in params {
                if !is_identifier(key) {
                    return Err(CodecError::Encode(format!("invalid parameter name {:?}", key)));
                }
                let _ = write!(out, " {}:", key);
                encode_value(value, out)?;
            }
        }
        Message::Reply { id, result } => {
            let _ = write!(out, "[{}]:", id);
            encode_value(result, out)?;
        }
        Message::ErrorReply { id, message, details } => {
            let _ = write!(out, "[{}]! message:", id);
            encode_str(message, out);
            out.push_str(" details:");
            encode_str(details, out);
        }
    }
    out.push('\n');
    Ok(())
}

fn encode_value(value: &Value, out: &mut String) -> Result<(), CodecError> {
    match value {
        Value::Int(v) => {
            let _ = write!(out, "{}", v);
        }
        Value::Float(v) => {
            if !v.is_finite() {
                return Err(CodecError::Encode(format!("{} has no terse representation", v)));
            }
            // Debug always includes a '.' or an exponent, which is what tells floats from ints
            let _ = write!(out, "{:?}", v);
        }
        Value::Str(s) => encode_str(s, out),
        Value::Bytes(b) => {
            out.push('\'');
            out.push_str(&base64::engine::general_purpose::STANDARD.encode(b));
            out.push('\'');
        }
        Value::List(items) => {
            out.push('[');
            for (idx, item) in items.iter().enumerate() {
                if idx > 0 {
                    out.push(' ');
                }
                encode_value(item, out)?;
            }
            out.push(']');
        }
        Value::Dict(entries) => {
            out.push('{');
            for (idx, (key, value)) in entries.iter().enumerate() {
                if idx > 0 {
                    out.push(' ');
                }
                if is_identifier(key) {
                    out.push_str(key);
                }
                else {
                    encode_str(key, out);
                }
                out.push(':');
                encode_value(value, out)?;
            }
            out.push('}');
        }
    }
    Ok(())
}

fn encode_str(s: &str, out: &mut String) {
    out.push('"');
    for c in s.chars() {
        match c {
            '\\' => out.push_str("\\\\"),
            '"' => out.push_str("\\\""),
            '\n' => out.push_str("\\n"),
            c => out.push(c),
        }
    }
    out.push('"');
}

fn decode_line(line: &[u8]) -> Result<Message, DecodeError> {
    let text = std::str::from_utf8(line)
        .map_err(|e| DecodeError { reason: format!("invalid UTF-8: {}", e), pos: e.valid_up_to() })?;
    let mut parser = Parser { text, pos: 0 };
    let message = parser.message()?;
    parser.skip_spaces();
    if !parser.at_end() {
        return Err(parser.error("trailing characters"));
    }
    Ok(message)
}

struct Parser<'a> {
    text: &'a str,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn error(&self, reason: impl Into<String>) -> DecodeError {
        DecodeError {
            reason: reason.into(),
            pos: self.pos,
        }
    }

    fn peek(&self) -> Option<char> {
        self.text[self.pos..].chars().next()
    }

    fn bump(&mut self) -> Option<char> {
        let c = self.peek()?;
        self.pos += c.len_utf8();
        Some(c)
    }

    fn at_end(&self) -> bool {
        self.pos >= self.text.len()
    }

    fn expect(&mut self, expected: char) -> Result<(), DecodeError> {
        match self.peek() {
            Some(c) if c == expected => {
                self.bump();
                Ok(())
            }
            _ => Err(self.error(format!("expected '{}'", expected))),
        }
    }

    fn skip_spaces(&mut self) {
        while self.peek() == Some(' ') {
            self.bump();
        }
    }

    fn take_while(&mut self, f: impl Fn(char) -> bool) -> &'a str {
        let start = self.pos;
        while self.peek().map_or(false, &f) {
            self.bump();
        }
        &self.text[start..self.pos]
    }

    /// After a list element or parameter: a space, or the closing delimiter / end of line
    fn expect_separator(&self, closing: Option<char>) -> Result<(), DecodeError> {
        match self.peek() {
            None if closing.is_none() => Ok(()),
            Some(' ') => Ok(()),
            Some(c) if Some(c) == closing => Ok(()),
            _ => Err(self.error("expected a space between values")),
        }
    }

    fn ident(&mut self) -> Result<&'a str, DecodeError> {
        let ident = self.take_while(is_ident_char);
        if ident.is_empty() {
            return Err(self.error("expected an identifier"));
        }
        Ok(ident)
    }

    fn id(&mut self) -> Result<u64, DecodeError> {
        let digits = self.take_while(|c| c.is_ascii_digit());
        digits.parse::<u64>()
            .map_err(|e| self.error(format!("invalid id {:?}: {}", digits, e)))
    }

    fn message(&mut self) -> Result<Message, DecodeError> {
        if self.peek() == Some('[') {
            self.bump();
            let id = self.id()?;
            self.expect(']')?;
            match self.bump() {
                Some(':') => {
                    let result = self.value()?;
                    Ok(Message::Reply { id, result })
                }
                Some('!') => {
                    let mut params = self.params()?;
                    let message = match params.remove("message") {
                        Some(Value::Str(s)) => s,
                        _ => return Err(self.error("error reply without a message string")),
                    };
                    let details = match params.remove("details") {
                        Some(Value::Str(s)) => s,
                        None => String::new(),
                        Some(_) => return Err(self.error("error reply details must be a string")),
                    };
                    Ok(Message::ErrorReply { id, message, details })
                }
                _ => Err(self.error("expected ':' or '!' after reply id")),
            }
        }
        else {
            let method = self.ident()?.to_string();
            let id = if self.peek() == Some('/') {
                self.bump();
                self.id()?
            }
            else {
                0
            };
            self.expect_separator(None)?;
            let params = self.params()?;
            Ok(Message::Call { method, params, id })
        }
    }

    /// `key:value key:value ...` up to the end of the line
    fn params(&mut self) -> Result<BTreeMap<String, Value>, DecodeError> {
        let mut params = BTreeMap::new();
        loop {
            self.skip_spaces();
            if self.at_end() {
                return Ok(params);
            }
            let key = self.ident()?.to_string();
            self.expect(':')?;
            let value = self.value()?;
            self.expect_separator(None)?;
            params.insert(key, value);
        }
    }

    fn value(&mut self) -> Result<Value, DecodeError> {
        match self.peek() {
            Some('"') => Ok(Value::Str(self.string()?)),
            Some('\'') => self.bytes(),
            Some('[') => self.list(),
            Some('{') => self.dict(),
            Some(c) if c == '-' || c.is_ascii_digit() => self.number(),
            Some(c) => Err(self.error(format!("unexpected character '{}'", c))),
            None => Err(self.error("expected a value")),
        }
    }

    fn string(&mut self) -> Result<String, DecodeError> {
        self.expect('"')?;
        let mut result = String::new();
        loop {
            match self.bump() {
                Some('"') => return Ok(result),
                Some('\\') => match self.bump() {
                    Some('\\') => result.push('\\'),
                    Some('"') => result.push('"'),
                    Some('n') => result.push('\n'),
                    _ => return Err(self.error("invalid escape sequence")),
                },
                Some(c) => result.push(c),
                None => return Err(self.error("unterminated string")),
            }
        }
    }

    fn bytes(&mut self) -> Result<Value, DecodeError> {
        self.expect('\'')?;
        let encoded = self.take_while(|c| c != '\'');
        self.expect('\'')?;
        base64::engine::general_purpose::STANDARD.decode(encoded)
            .map(|b| Value::Bytes(b.into()))
            .map_err(|e| self.error(format!("invalid base64: {}", e)))
    }

    fn list(&mut self) -> Result<Value, DecodeError> {
        self.expect('[')?;
        let mut items = Vec::new();
        loop {
            self.skip_spaces();
            if self.peek() == Some(']') {
                self.bump();
                return Ok(Value::List(items));
            }
            items.push(self.value()?);
            self.expect_separator(Some(']'))?;
        }
    }

    fn dict(&mut self) -> Result<Value, DecodeError> {
        self.expect('{')?;
        let mut entries = BTreeMap::new();
        loop {
            self.skip_spaces();
            if self.peek() == Some('}') {
                self.bump();
                return Ok(Value::Dict(entries));
            }
            let key = if self.peek() == Some('"') {
                self.string()?
            }
            else {
                self.ident()?.to_string()
            };
            self.expect(':')?;
            let value = self.value()?;
            self.expect_separator(Some('}'))?;
            entries.insert(key, value);
        }
    }

    fn number(&mut self) -> Result<Value, DecodeError> {
        let start = self.pos;
        let literal = self.take_while(|c| c.is_ascii_digit() || matches!(c, '-' | '+' | '.' | 'e' | 'E'));
        let result = if literal.contains(['.', 'e', 'E']) {
            literal.parse::<f64>().map(Value::Float).map_err(|e| e.to_string())
        }
        else {
            literal.parse::<i64>().map(Value::Int).map_err(|e| e.to_string())
        };
        result.map_err(|e| DecodeError { reason: format!("invalid number {:?}: {}", literal, e), pos: start })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use rstest::rstest;

    use super::*;

    fn encode(message: &Message) -> String {
        String::from_utf8(TerseCodec.encode(message, None).unwrap()).unwrap()
    }

    fn decode(data: &[u8]) -> Decoded {
        TerseCodec.decode(data, None).unwrap()
    }

    fn dict(entries: &[(&str, Value)]) -> Value {
        Value::Dict(entries.iter().map(|(k, v)| (k.to_string(), v.clone())).collect())
    }

    #[rstest]
    #[case::call_without_id(Message::call("ping", [("x", Value::Int(1))], 0), "ping x:1\n")]
    #[case::call_with_id(Message::call("ping", [("x", Value::Int(1))], 1), "ping/1 x:1\n")]
    #[case::call_without_params(Message::call::<String>("ping", [], 7), "ping/7\n")]
    #[case::params_sorted(Message::call("f", [("b", Value::Int(2)), ("a", Value::Int(1))], 0), "f a:1 b:2\n")]
    #[case::reply(Message::reply(1, 2), "[1]:2\n")]
    #[case::error_reply(Message::error_reply(3, "boom", "in f"), "[3]! message:\"boom\" details:\"in f\"\n")]
    #[case::negative(Message::reply(1, -5), "[1]:-5\n")]
    #[case::float(Message::reply(1, 1.5), "[1]:1.5\n")]
    #[case::whole_float(Message::reply(1, 2.0), "[1]:2.0\n")]
    #[case::escaped(Message::reply(1, "a\"b\\c\nd"), "[1]:\"a\\\"b\\\\c\\nd\"\n")]
    #[case::bytes(Message::reply(1, Bytes::from_static(b"hello")), "[1]:'aGVsbG8='\n")]
    #[case::list(Message::reply(1, vec![Value::Int(1), Value::from("x"), Value::List(vec![])]), "[1]:[1 \"x\" []]\n")]
    #[case::dict(Message::reply(1, dict(&[("a", Value::Int(1)), ("not ident", Value::Int(2))])), "[1]:{a:1 \"not ident\":2}\n")]
    fn test_encode(#[case] message: Message, #[case] expected: &str) {
        assert_eq!(encode(&message), expected);
    }

    #[rstest]
    #[case::bad_method(Message::call::<String>("no spaces", [], 0))]
    #[case::empty_method(Message::call::<String>("", [], 0))]
    #[case::bad_param_name(Message::call("f", [("1x", Value::Int(1))], 0))]
    #[case::nan(Message::reply(1, f64::NAN))]
    #[case::infinite(Message::reply(1, f64::INFINITY))]
    fn test_encode_rejects(#[case] message: Message) {
        assert!(matches!(TerseCodec.encode(&message, None), Err(CodecError::Encode(_))));
    }

    #[test]
    fn test_call_round_trip() {
        let nested = dict(&[
            ("list", Value::List(vec![Value::Float(0.25), Value::Bytes(Bytes::from_static(&[0, 1, 255]))])),
            ("with space", Value::from("v")),
            ("empty", dict(&[])),
        ]);
        let call = Message::call("node.update", [
            ("i", Value::Int(i64::MIN)),
            ("f", Value::Float(-1.0e-10)),
            ("s", Value::from("héllo wörld")),
            ("b", Value::Bytes(Bytes::new())),
            ("d", nested),
        ], 42);

        let encoded = TerseCodec.encode(&call, None).unwrap();
        let decoded = decode(&encoded);
        assert_eq!(decoded.messages, vec![call]);
        assert!(decoded.leftover.is_empty());
    }

    #[rstest]
    #[case::quote("\"")]
    #[case::backslash("\\")]
    #[case::newline("\n")]
    #[case::escape_lookalike("\\n")]
    #[case::mixed("a \"quoted\" line\nand a \\ backslash\\\"")]
    #[case::empty("")]
    fn test_string_escaping_round_trip(#[case] s: &str) {
        let reply = Message::reply(9, s);
        let encoded = TerseCodec.encode(&reply, None).unwrap();
        assert_eq!(encoded.iter().filter(|&&b| b == b'\n').count(), 1);
        assert_eq!(decode(&encoded).messages, vec![reply]);
    }

    #[test]
    fn test_error_reply_round_trip() {
        let error_reply = Message::error_reply(5, "division by zero", "line 1\nline 2");
        let encoded = TerseCodec.encode(&error_reply, None).unwrap();
        assert_eq!(decode(&encoded).messages, vec![error_reply]);

        // details are optional on the wire
        assert_eq!(decode(b"[5]! message:\"x\"\n").messages, vec![Message::error_reply(5, "x", "")]);
    }

    #[test]
    fn test_split_at_every_offset() {
        let stream = b"ping/1 x:1\n[1]:\"two\\nlines\" \n[2]! message:\"m\" details:\"d\"\n";
        let expected = decode(stream).messages;
        assert_eq!(expected.len(), 3);

        for offset in 0..=stream.len() {
            let (first, second) = stream.split_at(offset);
            let decoded_first = decode(first);

            let mut rest = decoded_first.leftover.clone();
            rest.extend_from_slice(second);
            let decoded_second = decode(&rest);

            let mut messages = decoded_first.messages;
            messages.extend(decoded_second.messages);
            assert_eq!(messages, expected, "split at {}", offset);
            assert!(decoded_second.leftover.is_empty());
        }
    }

    #[test]
    fn test_malformed_line_is_skipped() {
        let decoded = decode(b"ping/1 x:1\nthis is not terse\n[1]:2\n");
        assert_eq!(decoded.messages, vec![
            Message::call("ping", [("x", Value::Int(1))], 1),
            Message::reply(1, 2),
        ]);
    }

    #[rstest]
    #[case::bare_word("hello world")]
    #[case::missing_value("ping x:")]
    #[case::missing_colon("ping x")]
    #[case::unterminated_string("[1]:\"abc")]
    #[case::bad_escape("[1]:\"\\t\"")]
    #[case::bad_base64("[1]:'!!!'")]
    #[case::unclosed_list("[1]:[1 2")]
    #[case::unclosed_dict("[1]:{a:1")]
    #[case::no_separator("[1]:[1\"a\"]")]
    #[case::bad_reply_marker("[1]?2")]
    #[case::bad_id("ping/x a:1")]
    #[case::id_overflow("ping/99999999999999999999")]
    #[case::int_overflow("[1]:99999999999999999999")]
    #[case::bad_number("[1]:1.2.3")]
    #[case::trailing("[1]:2 3")]
    #[case::error_without_message("[1]! details:\"d\"")]
    fn test_malformed(#[case] line: &str) {
        let data = format!("{}\n", line).into_bytes();

        let decoded = decode(&data);
        assert!(decoded.messages.is_empty(), "{:?} decoded as {:?}", line, decoded.messages);
        assert!(decoded.leftover.is_empty());
    }

    #[test]
    fn test_invalid_utf8_is_skipped() {
        let decoded = decode(b"[1]:\"\xff\"\n[2]:3\n");
        assert_eq!(decoded.messages, vec![Message::reply(2, 3)]);
    }

    #[test]
    fn test_blank_lines_and_crlf() {
        let decoded = decode(b"\n\r\nping x:1\r\n\n[1]:2");
        assert_eq!(decoded.messages, vec![Message::call("ping", [("x", Value::Int(1))], 0)]);
        assert_eq!(decoded.leftover, b"[1]:2".to_vec());
    }

    #[test]
    fn test_security_params_rejected() {
        let security = SecurityParams::default();
        let message = Message::reply(1, 2);

        assert!(matches!(TerseCodec.encode(&message, Some(&security)), Err(CodecError::SecurityUnsupported("terse"))));
        assert!(matches!(TerseCodec.decode(b"[1]:2\n", Some(&security)), Err(CodecError::SecurityUnsupported("terse"))));
    }
}
