//! The lonet wire handshake: a single newline-terminated line in each
//! direction, with `qq`-style C quoting of the embedded strings.
//!
//! ```text
//! > lonet "<network>" dial "<src>" "<dst>"\n
//! < lonet "<network>" <verb> "<arg>"\n
//! ```

use once_cell::sync::Lazy;
use regex::Regex;

/// Wraps `s` in `"..."`, escaping `"`, `\`, and any byte outside printable
/// ASCII with a `\xHH` (or `\n`/`\t`/`\r`) short escape — the same
/// C-style quoting the reference peer uses to frame arbitrary bytes in a
/// single text line.
pub fn qq(s: &str) -> String {
    let mut out = String::with_capacity(s.len() + 2);
    out.push('"');
    for b in s.bytes() {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            _ => out.push_str(&format!("\\x{:02x}", b)),
        }
    }
    out.push('"');
    out
}

/// Reverses [`qq`]. Fails if `s` is not a well-formed `"..."` literal.
pub fn unqq(s: &str) -> Result<String, String> {
    let bytes = s.as_bytes();
    if bytes.len() < 2 || bytes[0] != b'"' || bytes[bytes.len() - 1] != b'"' {
        return Err(format!("{s:?} is not a quoted string"));
    }
    let inner = &bytes[1..bytes.len() - 1];
    let mut out = Vec::with_capacity(inner.len());
    let mut i = 0;
    while i < inner.len() {
        if inner[i] != b'\\' {
            out.push(inner[i]);
            i += 1;
            continue;
        }
        i += 1;
        let esc = *inner.get(i).ok_or_else(|| format!("{s:?}: truncated escape"))?;
        match esc {
            b'"' => out.push(b'"'),
            b'\\' => out.push(b'\\'),
            b'n' => out.push(b'\n'),
            b'r' => out.push(b'\r'),
            b't' => out.push(b'\t'),
            b'x' => {
                let hex = inner
                    .get(i + 1..i + 3)
                    .ok_or_else(|| format!("{s:?}: truncated \\x escape"))?;
                let hex = std::str::from_utf8(hex).map_err(|_| format!("{s:?}: bad \\x escape"))?;
                let byte = u8::from_str_radix(hex, 16).map_err(|_| format!("{s:?}: bad \\x escape"))?;
                out.push(byte);
                i += 2;
            }
            other => return Err(format!("{s:?}: unknown escape \\{}", other as char)),
        }
        i += 1;
    }
    String::from_utf8(out).map_err(|_| format!("{s:?}: not valid utf-8 after unescaping"))
}

static LODIAL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^> lonet (?P<network>"(?:[^"\\]|\\.)*") dial (?P<src>"(?:[^"\\]|\\.)*") (?P<dst>"(?:[^"\\]|\\.)*")\n$"#).unwrap()
});

static LOREPLY_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"^< lonet (?P<network>"(?:[^"\\]|\\.)*") (?P<verb>[^\s]+) (?P<arg>"(?:[^"\\]|\\.)*")\n$"#).unwrap()
});

/// A parsed `> lonet "..." dial "..." "..."\n` request line.
pub struct DialLine {
    pub network: String,
    pub src: String,
    pub dst: String,
}

pub fn format_dial_line(network: &str, src: &str, dst: &str) -> String {
    format!("> lonet {} dial {} {}\n", qq(network), qq(src), qq(dst))
}

pub fn parse_dial_line(line: &str) -> Result<DialLine, String> {
    let caps = LODIAL_RE
        .captures(line)
        .ok_or_else(|| format!("invalid dial request: {}", qq(line)))?;
    Ok(DialLine {
        network: unqq(&caps["network"])?,
        src: unqq(&caps["src"])?,
        dst: unqq(&caps["dst"])?,
    })
}

/// A parsed `< lonet "..." <verb> "..."\n` reply line.
pub struct ReplyLine {
    pub network: String,
    pub verb: String,
    pub arg: String,
}

pub fn format_reply_line(network: &str, verb: &str, arg: &str) -> String {
    format!("< lonet {} {} {}\n", qq(network), verb, qq(arg))
}

pub fn parse_reply_line(line: &str) -> Result<ReplyLine, String> {
    let caps = LOREPLY_RE
        .captures(line)
        .ok_or_else(|| format!("invalid dial reply: {}", qq(line)))?;
    Ok(ReplyLine {
        network: unqq(&caps["network"])?,
        verb: caps["verb"].to_string(),
        arg: unqq(&caps["arg"])?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quote_roundtrips_printable() {
        assert_eq!(unqq(&qq("hello world")).unwrap(), "hello world");
    }

    #[test]
    fn quote_escapes_quote_and_backslash() {
        let s = r#"a"b\c"#;
        assert_eq!(qq(s), r#""a\"b\\c""#);
        assert_eq!(unqq(&qq(s)).unwrap(), s);
    }

    #[test]
    fn quote_escapes_control_bytes() {
        let s = "a\x01b";
        assert_eq!(qq(s), r#""a\x01b""#);
        assert_eq!(unqq(&qq(s)).unwrap(), s);
    }

    #[test]
    fn dial_line_roundtrips() {
        let line = format_dial_line("lonetX", "alpha:1", "beta:2");
        let parsed = parse_dial_line(&line).unwrap();
        assert_eq!(parsed.network, "lonetX");
        assert_eq!(parsed.src, "alpha:1");
        assert_eq!(parsed.dst, "beta:2");
    }

    #[test]
    fn reply_line_roundtrips_connected() {
        let line = format_reply_line("lonetX", "connected", "alpha:2");
        let parsed = parse_reply_line(&line).unwrap();
        assert_eq!(parsed.network, "lonetX");
        assert_eq!(parsed.verb, "connected");
        assert_eq!(parsed.arg, "alpha:2");
    }

    #[test]
    fn reply_line_roundtrips_error_verb() {
        let line = format_reply_line("lonetX", "E", "connection refused");
        let parsed = parse_reply_line(&line).unwrap();
        assert_eq!(parsed.verb, "E");
        assert_eq!(parsed.arg, "connection refused");
    }

    #[test]
    fn malformed_line_is_rejected() {
        assert!(parse_dial_line("garbage\n").is_err());
        assert!(parse_reply_line("garbage\n").is_err());
    }
}
