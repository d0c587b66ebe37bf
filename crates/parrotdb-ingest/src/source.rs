//! The XML tokenizer: a non-copying streaming lexer over a byte source.
//!
//! A source owns a file descriptor and a byte window, either buffered
//! read-mode or a memory mapping.  `next_token` returns slices pointing
//! directly into the window; they stay valid until the next call on the
//! same source, which the borrow checker enforces.  In read-mode the
//! retained tail is slid to the window start on refill and the window is
//! grown when a single token outruns it, so token slices are always
//! contiguous.
//!
//! Only the shapes of `<`, `>`, `/`, `!`, `?`, `=`, quotes, and
//! whitespace are interpreted; entity references pass through as literal
//! bytes.

use std::fs::File;
use std::io::Read;
use std::ops::Range;
use std::path::Path;

use memmap2::Mmap;
use tracing::error;

use parrotdb_error::{ParrotError, Result};

use crate::XmlType;

/// The window is a memory mapping.
pub const SF_MMAP: u32 = 1 << 0;
/// Drop whitespace-only mixed content.
pub const SF_IGNOREWS: u32 = 1 << 1;
/// Do not issue reads on this source.
pub const SF_NOREAD: u32 = 1 << 2;
/// EOF has been seen; reads would fail.
pub const SF_EOFSEEN: u32 = 1 << 3;
/// The input is completely resident in memory.
pub const SF_READALL: u32 = 1 << 4;
/// Trim leading and trailing whitespace from text tokens.
pub const SF_TRIMWS: u32 = 1 << 6;

const DEFAULT_WINDOW: usize = 8 * 1024;

/// One token window: `data` and `rest` point into the source's buffer and
/// are valid until the next `next_token` on the same source.
#[derive(Debug)]
pub struct Token<'a> {
    pub ttype: XmlType,
    pub data: Option<&'a [u8]>,
    pub rest: Option<&'a [u8]>,
}

enum Window {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

enum Markup {
    Token {
        ttype: XmlType,
        data: Option<Range<usize>>,
        rest: Option<Range<usize>>,
        consume: usize,
    },
    Need,
    Malformed,
}

type Scan = (XmlType, Option<Range<usize>>, Option<Range<usize>>);

/// An input byte stream with tokenizer state.
pub struct Source {
    file: Option<File>,
    filename: String,
    window: Window,
    len: usize,
    curp: usize,
    offset: u64,
    lineno: u32,
    flags: u32,
    last: XmlType,
}

impl Source {
    /// Open a file as a source, preferring a memory mapping and falling
    /// back to buffered reads.
    pub fn open(path: impl AsRef<Path>, flags: u32) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|e| ParrotError::io(path, e))?;
        let size = file
            .metadata()
            .map_err(|e| ParrotError::io(path, e))?
            .len();
        let filename = path.display().to_string();
        if size > 0 {
            if let Ok(map) = unsafe { Mmap::map(&file) } {
                let len = map.len();
                return Ok(Source {
                    file: Some(file),
                    filename,
                    window: Window::Mapped(map),
                    len,
                    curp: 0,
                    offset: 0,
                    lineno: 1,
                    flags: flags | SF_MMAP | SF_NOREAD | SF_READALL,
                    last: XmlType::None,
                });
            }
        }
        Ok(Self::from_file(file, flags, filename))
    }

    /// Wrap an already-open file in buffered read mode.
    pub fn from_file(file: File, flags: u32, filename: String) -> Self {
        Self::buffered(Some(file), flags, filename, DEFAULT_WINDOW)
    }

    /// Wrap an in-memory byte string; the whole input is resident.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>, flags: u32) -> Self {
        let buf = bytes.into();
        let len = buf.len();
        Source {
            file: None,
            filename: "<memory>".to_owned(),
            window: Window::Owned(buf),
            len,
            curp: 0,
            offset: 0,
            lineno: 1,
            flags: flags | SF_NOREAD | SF_READALL,
            last: XmlType::None,
        }
    }

    fn buffered(file: Option<File>, flags: u32, filename: String, capacity: usize) -> Self {
        Source {
            file,
            filename,
            window: Window::Owned(vec![0; capacity]),
            len: 0,
            curp: 0,
            offset: 0,
            lineno: 1,
            flags,
            last: XmlType::None,
        }
    }

    /// Current line number (for diagnostics only).
    #[must_use]
    pub fn lineno(&self) -> u32 {
        self.lineno
    }

    /// Absolute byte offset of the next unconsumed byte.
    #[must_use]
    pub fn offset(&self) -> u64 {
        self.offset + self.curp as u64
    }

    #[must_use]
    pub fn flags(&self) -> u32 {
        self.flags
    }

    fn bytes(&self) -> &[u8] {
        match &self.window {
            Window::Owned(v) => &v[..self.len],
            Window::Mapped(m) => &m[..self.len],
        }
    }

    /// Pull the next token.  `data` and `rest` remain valid until the
    /// next call on this source; malformed input latches the source into
    /// the failure state.
    pub fn next_token(&mut self) -> Token<'_> {
        let (ttype, data, rest) = self.scan();
        self.last = ttype;
        let buf = self.bytes();
        Token {
            ttype,
            data: data.map(|r| &buf[r]),
            rest: rest.map(|r| &buf[r]),
        }
    }

    fn scan(&mut self) -> Scan {
        if self.last == XmlType::Fail {
            return (XmlType::Fail, None, None);
        }
        loop {
            if self.curp >= self.len {
                if !self.refill() {
                    return (XmlType::Eof, None, None);
                }
                continue;
            }
            if self.bytes()[self.curp] == b'<' {
                return self.scan_markup();
            }
            if let Some(token) = self.scan_text() {
                return token;
            }
            // Whitespace-only content was dropped; keep pulling.
        }
    }

    fn scan_text(&mut self) -> Option<Scan> {
        let end = loop {
            let buf = self.bytes();
            if let Some(pos) = buf[self.curp..].iter().position(|&b| b == b'<') {
                break self.curp + pos;
            }
            if !self.refill() {
                break self.len;
            }
        };
        let start = self.curp;
        self.advance_to(end);

        let buf = self.bytes();
        if self.flags & SF_IGNOREWS != 0 && buf[start..end].iter().all(u8::is_ascii_whitespace) {
            return None;
        }
        let (mut s, mut e) = (start, end);
        if self.flags & SF_TRIMWS != 0 {
            while s < e && buf[s].is_ascii_whitespace() {
                s += 1;
            }
            while e > s && buf[e - 1].is_ascii_whitespace() {
                e -= 1;
            }
        }
        Some((XmlType::Text, Some(s..e), None))
    }

    fn scan_markup(&mut self) -> Scan {
        loop {
            match self.try_markup() {
                Markup::Token {
                    ttype,
                    data,
                    rest,
                    consume,
                } => {
                    self.advance_to(consume);
                    return (ttype, data, rest);
                }
                Markup::Need => {
                    if !self.refill() {
                        error!(
                            file = %self.filename,
                            line = self.lineno,
                            "unterminated markup at end of input"
                        );
                        return (XmlType::Fail, None, None);
                    }
                }
                Markup::Malformed => {
                    error!(file = %self.filename, line = self.lineno, "malformed markup");
                    return (XmlType::Fail, None, None);
                }
            }
        }
    }

    /// Attempt to lex one markup token from the current window without
    /// consuming anything.
    fn try_markup(&self) -> Markup {
        let buf = self.bytes();
        let i = self.curp;
        if i + 1 >= self.len {
            return Markup::Need;
        }
        match buf[i + 1] {
            b'!' => {
                if self.len - i < 4 {
                    return Markup::Need;
                }
                if &buf[i + 2..i + 4] == b"--" {
                    match find(buf, i + 4, b"-->") {
                        Some(p) => Markup::Token {
                            ttype: XmlType::Comment,
                            data: Some(i + 4..p),
                            rest: None,
                            consume: p + 3,
                        },
                        None => Markup::Need,
                    }
                } else {
                    match find_byte(buf, i + 2, b'>') {
                        Some(p) => Markup::Token {
                            ttype: XmlType::Dtd,
                            data: Some(i + 2..p),
                            rest: None,
                            consume: p + 1,
                        },
                        None => Markup::Need,
                    }
                }
            }
            b'?' => match find(buf, i + 2, b"?>") {
                Some(p) => {
                    let mut name_end = i + 2;
                    while name_end < p && !buf[name_end].is_ascii_whitespace() {
                        name_end += 1;
                    }
                    let mut rest_start = name_end;
                    while rest_start < p && buf[rest_start].is_ascii_whitespace() {
                        rest_start += 1;
                    }
                    Markup::Token {
                        ttype: XmlType::Pi,
                        data: Some(i + 2..name_end),
                        rest: if rest_start < p {
                            Some(rest_start..p)
                        } else {
                            None
                        },
                        consume: p + 2,
                    }
                }
                None => Markup::Need,
            },
            b'/' => match find_byte(buf, i + 2, b'>') {
                Some(p) => {
                    let mut e = p;
                    while e > i + 2 && buf[e - 1].is_ascii_whitespace() {
                        e -= 1;
                    }
                    if e == i + 2 {
                        return Markup::Malformed;
                    }
                    Markup::Token {
                        ttype: XmlType::Close,
                        data: Some(i + 2..e),
                        rest: None,
                        consume: p + 1,
                    }
                }
                None => Markup::Need,
            },
            c if is_name_start(c) => {
                let mut j = i + 1;
                while j < self.len && is_name_char(buf[j]) {
                    j += 1;
                }
                if j >= self.len {
                    return Markup::Need;
                }
                // Find the closing '>', skipping quoted attribute values.
                let mut k = j;
                let mut quote = 0u8;
                while k < self.len {
                    let b = buf[k];
                    if quote != 0 {
                        if b == quote {
                            quote = 0;
                        }
                    } else if b == b'"' || b == b'\'' {
                        quote = b;
                    } else if b == b'>' {
                        break;
                    }
                    k += 1;
                }
                if k >= self.len {
                    return Markup::Need;
                }
                let empty = k > j && buf[k - 1] == b'/';
                let attr_end = if empty { k - 1 } else { k };
                let mut a = j;
                while a < attr_end && buf[a].is_ascii_whitespace() {
                    a += 1;
                }
                let mut ae = attr_end;
                while ae > a && buf[ae - 1].is_ascii_whitespace() {
                    ae -= 1;
                }
                Markup::Token {
                    ttype: if empty { XmlType::Empty } else { XmlType::Open },
                    data: Some(i + 1..j),
                    rest: Some(a..ae),
                    consume: k + 1,
                }
            }
            _ => Markup::Malformed,
        }
    }

    fn advance_to(&mut self, to: usize) {
        let newlines = self.bytes()[self.curp..to]
            .iter()
            .filter(|&&b| b == b'\n')
            .count();
        self.lineno += newlines as u32;
        self.curp = to;
    }

    /// Slide the retained tail to the window start and read more bytes.
    /// Returns false once no further input can arrive.
    fn refill(&mut self) -> bool {
        if self.flags & (SF_NOREAD | SF_EOFSEEN) != 0 {
            return false;
        }
        let Window::Owned(buf) = &mut self.window else {
            return false;
        };
        let Some(file) = self.file.as_mut() else {
            self.flags |= SF_EOFSEEN;
            return false;
        };
        if self.curp > 0 {
            buf.copy_within(self.curp..self.len, 0);
            self.len -= self.curp;
            self.offset += self.curp as u64;
            self.curp = 0;
        }
        if self.len == buf.len() {
            // A single token outran the window; grow it so the token
            // stays contiguous.
            let doubled = buf.len() * 2;
            buf.resize(doubled, 0);
        }
        match file.read(&mut buf[self.len..]) {
            Ok(0) => {
                self.flags |= SF_EOFSEEN;
                false
            }
            Ok(n) => {
                self.len += n;
                true
            }
            Err(e) => {
                error!(file = %self.filename, error = %e, "read failed");
                self.flags |= SF_EOFSEEN;
                false
            }
        }
    }
}

fn find(buf: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if buf.len() < needle.len() {
        return None;
    }
    (from..=buf.len() - needle.len()).find(|&p| &buf[p..p + needle.len()] == needle)
}

fn find_byte(buf: &[u8], from: usize, byte: u8) -> Option<usize> {
    buf[from..].iter().position(|&b| b == byte).map(|p| from + p)
}

fn is_name_start(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_' || b == b':' || b >= 0x80
}

fn is_name_char(b: u8) -> bool {
    b.is_ascii_alphanumeric() || matches!(b, b'-' | b'_' | b'.' | b':') || b >= 0x80
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn tokens(input: &str, flags: u32) -> Vec<(XmlType, Option<Vec<u8>>, Option<Vec<u8>>)> {
        let mut src = Source::from_bytes(input.as_bytes().to_vec(), flags);
        let mut out = Vec::new();
        loop {
            let tok = src.next_token();
            let done = matches!(tok.ttype, XmlType::Eof | XmlType::Fail);
            out.push((
                tok.ttype,
                tok.data.map(<[u8]>::to_vec),
                tok.rest.map(<[u8]>::to_vec),
            ));
            if done {
                break;
            }
        }
        out
    }

    #[test]
    fn minimal_document() {
        let toks = tokens(r#"<a x="1">hi</a>"#, 0);
        assert_eq!(
            toks,
            vec![
                (
                    XmlType::Open,
                    Some(b"a".to_vec()),
                    Some(b"x=\"1\"".to_vec())
                ),
                (XmlType::Text, Some(b"hi".to_vec()), None),
                (XmlType::Close, Some(b"a".to_vec()), None),
                (XmlType::Eof, None, None),
            ]
        );
    }

    #[test]
    fn empty_element() {
        let toks = tokens("<br/>", 0);
        assert_eq!(
            toks,
            vec![
                (XmlType::Empty, Some(b"br".to_vec()), Some(b"".to_vec())),
                (XmlType::Eof, None, None),
            ]
        );
    }

    #[test]
    fn comment_pi_and_dtd() {
        let toks = tokens(
            "<!-- a comment --><?xml version=\"1.0\"?><!DOCTYPE top><top/>",
            0,
        );
        assert_eq!(toks[0].0, XmlType::Comment);
        assert_eq!(toks[0].1.as_deref(), Some(&b" a comment "[..]));
        assert_eq!(toks[1].0, XmlType::Pi);
        assert_eq!(toks[1].1.as_deref(), Some(&b"xml"[..]));
        assert_eq!(toks[1].2.as_deref(), Some(&b"version=\"1.0\""[..]));
        assert_eq!(toks[2].0, XmlType::Dtd);
        assert_eq!(toks[2].1.as_deref(), Some(&b"DOCTYPE top"[..]));
        assert_eq!(toks[3].0, XmlType::Empty);
    }

    #[test]
    fn whitespace_round_trip_without_ignorews() {
        let input = "<a>  \n one </a>\n<b>two</b>";
        let toks = tokens(input, 0);
        let text: Vec<u8> = toks
            .iter()
            .filter(|t| t.0 == XmlType::Text)
            .flat_map(|t| t.1.clone().unwrap())
            .collect();
        assert_eq!(text, b"  \n one \ntwo");
    }

    #[test]
    fn ignorews_drops_whitespace_only_content() {
        let toks = tokens("<a>\n  <b>x</b>\n</a>", SF_IGNOREWS);
        let types: Vec<XmlType> = toks.iter().map(|t| t.0).collect();
        assert_eq!(
            types,
            vec![
                XmlType::Open,
                XmlType::Open,
                XmlType::Text,
                XmlType::Close,
                XmlType::Close,
                XmlType::Eof,
            ]
        );
    }

    #[test]
    fn trimws_shifts_token_edges() {
        let toks = tokens("<a>  padded  </a>", SF_TRIMWS);
        assert_eq!(toks[1].1.as_deref(), Some(&b"padded"[..]));
    }

    #[test]
    fn quoted_gt_does_not_close_a_tag() {
        let toks = tokens(r#"<a x="1>2" y='<'>t</a>"#, 0);
        assert_eq!(toks[0].0, XmlType::Open);
        assert_eq!(toks[0].2.as_deref(), Some(&br#"x="1>2" y='<'"#[..]));
    }

    #[test]
    fn malformed_markup_latches_fail() {
        let mut src = Source::from_bytes(b"<a><>".to_vec(), 0);
        assert_eq!(src.next_token().ttype, XmlType::Open);
        assert_eq!(src.next_token().ttype, XmlType::Fail);
        // Latched: every further call keeps failing.
        assert_eq!(src.next_token().ttype, XmlType::Fail);
        assert_eq!(src.next_token().ttype, XmlType::Fail);
    }

    #[test]
    fn truncated_markup_fails_at_eof() {
        let mut src = Source::from_bytes(b"<a><unclosed".to_vec(), 0);
        assert_eq!(src.next_token().ttype, XmlType::Open);
        assert_eq!(src.next_token().ttype, XmlType::Fail);
    }

    #[test]
    fn repeated_eof_after_end() {
        let mut src = Source::from_bytes(b"<a/>".to_vec(), 0);
        assert_eq!(src.next_token().ttype, XmlType::Empty);
        assert_eq!(src.next_token().ttype, XmlType::Eof);
        assert_eq!(src.next_token().ttype, XmlType::Eof);
    }

    #[test]
    fn line_numbers_track_newlines() {
        let mut src = Source::from_bytes(b"<a>\n\n<b>x</b>\n</a>".to_vec(), 0);
        assert_eq!(src.lineno(), 1);
        while !matches!(src.next_token().ttype, XmlType::Eof | XmlType::Fail) {}
        assert_eq!(src.lineno(), 4);
    }

    #[test]
    fn tokens_straddle_refill_boundaries() {
        // A tiny window forces refills inside tokens; data must still
        // come back contiguous.
        let mut file = tempfile::tempfile().unwrap();
        let body = format!(
            "<root><item name=\"{}\">{}</item></root>",
            "n".repeat(40),
            "x".repeat(100)
        );
        file.write_all(body.as_bytes()).unwrap();
        use std::io::Seek;
        file.rewind().unwrap();

        let mut src = Source::buffered(Some(file), 0, "<test>".to_owned(), 16);
        let tok = src.next_token();
        assert_eq!(tok.ttype, XmlType::Open);
        assert_eq!(tok.data.unwrap(), b"root");
        let tok = src.next_token();
        assert_eq!(tok.ttype, XmlType::Open);
        assert_eq!(tok.data.unwrap(), b"item");
        assert_eq!(tok.rest.unwrap().len(), "name=\"\"".len() + 40);
        let tok = src.next_token();
        assert_eq!(tok.ttype, XmlType::Text);
        assert_eq!(tok.data.unwrap(), "x".repeat(100).as_bytes());
        assert_eq!(src.next_token().ttype, XmlType::Close);
        assert_eq!(src.next_token().ttype, XmlType::Close);
        assert_eq!(src.next_token().ttype, XmlType::Eof);
    }

    #[test]
    fn mmap_source_tokenizes_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("doc.xml");
        std::fs::write(&path, b"<doc><p>hello</p></doc>").unwrap();
        let mut src = Source::open(&path, 0).unwrap();
        assert!(src.flags() & SF_MMAP != 0);
        let mut types = Vec::new();
        loop {
            let t = src.next_token().ttype;
            types.push(t);
            if matches!(t, XmlType::Eof | XmlType::Fail) {
                break;
            }
        }
        assert_eq!(
            types,
            vec![
                XmlType::Open,
                XmlType::Open,
                XmlType::Text,
                XmlType::Close,
                XmlType::Close,
                XmlType::Eof,
            ]
        );
    }
}
