//! Forward-scanning extraction for the semi-structured markup the
//! issuing service, identity providers and attribute authorities reply
//! with.
//!
//! There is deliberately no DOM. Every reply shape is handled by
//! composing the single [`find_element`] primitive: scan strictly
//! forward from a byte offset for the next element with a given name,
//! then read its attributes and text. Repeated elements are reached by
//! scanning again from the previous match's [`Element::end`].

/// An element located by [`find_element`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element<'a> {
    name: &'a str,
    attributes: &'a str,
    content: &'a str,
    end: usize,
}

impl<'a> Element<'a> {
    /// Tag name exactly as written in the document.
    pub fn name(&self) -> &'a str {
        self.name
    }

    /// Raw text between the open and close tags, nested markup included.
    pub fn content(&self) -> &'a str {
        self.content
    }

    /// Content with surrounding whitespace removed.
    pub fn text(&self) -> &'a str {
        self.content.trim()
    }

    /// Byte offset just past this element; start the next scan here.
    pub fn end(&self) -> usize {
        self.end
    }

    /// Case-insensitive attribute lookup on the open tag. Quoted and
    /// unquoted values are both accepted; attributes without a value
    /// yield nothing.
    pub fn attribute(&self, name: &str) -> Option<&'a str> {
        let mut rest = self.attributes;
        loop {
            rest = rest.trim_start();
            if rest.is_empty() {
                return None;
            }
            let name_len = rest
                .find(|c: char| c == '=' || c.is_whitespace())
                .unwrap_or(rest.len());
            let (attr, after) = rest.split_at(name_len);
            let after = after.trim_start();
            let Some(value_part) = after.strip_prefix('=') else {
                rest = after;
                continue;
            };
            let value_part = value_part.trim_start();
            let (value, remainder) = if let Some(quoted) = value_part.strip_prefix('"') {
                match quoted.find('"') {
                    Some(close) => (&quoted[..close], &quoted[close + 1..]),
                    None => (quoted, ""),
                }
            } else if let Some(quoted) = value_part.strip_prefix('\'') {
                match quoted.find('\'') {
                    Some(close) => (&quoted[..close], &quoted[close + 1..]),
                    None => (quoted, ""),
                }
            } else {
                let close = value_part
                    .find(|c: char| c.is_whitespace())
                    .unwrap_or(value_part.len());
                (&value_part[..close], &value_part[close..])
            };
            if attr.eq_ignore_ascii_case(name) {
                return Some(value);
            }
            rest = remainder;
        }
    }
}

/// Finds the next element named `name` at or after byte offset `from`.
///
/// Matching ignores ASCII case and namespace prefixes, so asking for
/// `Conditions` also matches `<saml:Conditions>`. Close tags, comments
/// and processing instructions are skipped. Self-closed elements match
/// with empty content. An element whose close tag never appears is not
/// matched.
pub fn find_element<'a>(body: &'a str, name: &str, from: usize) -> Option<Element<'a>> {
    let bytes = body.as_bytes();
    let mut cursor = from.min(body.len());
    while let Some(offset) = body[cursor..].find('<') {
        let lt = cursor + offset;
        let mut i = lt + 1;
        if i >= bytes.len() {
            return None;
        }
        if bytes[i] == b'!' {
            if body[lt..].starts_with("<!--") {
                // jump past the whole comment, commented-out markup included
                match body[lt + 4..].find("-->") {
                    Some(close) => {
                        cursor = lt + 4 + close + 3;
                        continue;
                    }
                    None => return None,
                }
            }
            cursor = i;
            continue;
        }
        if matches!(bytes[i], b'/' | b'?') {
            cursor = i;
            continue;
        }
        let name_start = i;
        while i < bytes.len() && !is_name_end(bytes[i]) {
            i += 1;
        }
        let tag = &body[name_start..i];
        if tag.is_empty() || !name_matches(tag, name) {
            cursor = i.max(lt + 1);
            continue;
        }

        // locate the end of the open tag, honouring quoted attribute values
        let attrs_start = i;
        let mut quote: Option<u8> = None;
        let mut j = i;
        let mut open_end = None;
        while j < bytes.len() {
            let b = bytes[j];
            match quote {
                Some(q) => {
                    if b == q {
                        quote = None;
                    }
                }
                None => match b {
                    b'"' | b'\'' => quote = Some(b),
                    b'>' => {
                        open_end = Some(j);
                        break;
                    }
                    _ => {}
                },
            }
            j += 1;
        }
        let open_end = open_end?;

        let attrs_raw = &body[attrs_start..open_end];
        if let Some(trimmed) = attrs_raw.trim_end().strip_suffix('/') {
            return Some(Element {
                name: tag,
                attributes: trimmed,
                content: &body[open_end..open_end],
                end: open_end + 1,
            });
        }

        let content_start = open_end + 1;
        let mut k = content_start;
        loop {
            let rel = body[k..].find("</")?;
            let close_lt = k + rel;
            let mut m = close_lt + 2;
            let close_name_start = m;
            while m < bytes.len() && !is_name_end(bytes[m]) {
                m += 1;
            }
            if body[close_name_start..m].eq_ignore_ascii_case(tag) {
                let gt = body[m..].find('>')?;
                return Some(Element {
                    name: tag,
                    attributes: attrs_raw,
                    content: &body[content_start..close_lt],
                    end: m + gt + 1,
                });
            }
            k = close_lt + 2;
        }
    }
    None
}

fn is_name_end(b: u8) -> bool {
    matches!(b, b'>' | b'/' | b'=') || b.is_ascii_whitespace()
}

fn name_matches(tag: &str, wanted: &str) -> bool {
    let local = tag.rsplit(':').next().unwrap_or(tag);
    local.eq_ignore_ascii_case(wanted)
}
