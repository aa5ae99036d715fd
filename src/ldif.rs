//! LDIF rendering of decoded entries and result trailers.

use crate::decoder::{Entry, LdapResult};
use base64::Engine;
use std::io::{self, Write};

/// True when `value` can be written as a plain `attr: value` line.
pub fn is_safe_value(value: &[u8]) -> bool {
    let Ok(text) = std::str::from_utf8(value) else {
        return false;
    };
    if text.starts_with([' ', ':', '<']) || text.ends_with(' ') {
        return false;
    }
    !text.bytes().any(|b| matches!(b, b'\0' | b'\r' | b'\n'))
}

fn write_line<W: Write>(out: &mut W, name: &str, value: &[u8]) -> io::Result<()> {
    if is_safe_value(value) {
        // Safe values are valid UTF-8.
        writeln!(out, "{}: {}", name, String::from_utf8_lossy(value))
    } else {
        let encoded = base64::engine::general_purpose::STANDARD.encode(value);
        writeln!(out, "{}:: {}", name, encoded)
    }
}

/// `dn:` line, then one line per value in attribute arrival order, then a
/// blank separator line.
pub fn write_entry<W: Write>(out: &mut W, entry: &Entry) -> io::Result<()> {
    write_line(out, "dn", entry.dn().as_bytes())?;
    for name in entry.attribute_names() {
        let values = entry.get(name).unwrap_or_default();
        if values.is_empty() {
            // typesOnly searches return names without values.
            writeln!(out, "{}:", name)?;
        }
        for value in values {
            write_line(out, name, value)?;
        }
    }
    writeln!(out)
}

pub fn entry_to_ldif(entry: &Entry) -> String {
    let mut buf = Vec::new();
    // Writing into a Vec cannot fail.
    let _ = write_entry(&mut buf, entry);
    String::from_utf8_lossy(&buf).into_owned()
}

/// Comment trailer in the style of ldapsearch: `# result: 0 Success`.
pub fn write_result<W: Write>(out: &mut W, result: &LdapResult) -> io::Result<()> {
    writeln!(out, "# result: {} {}", result.result_code, result.message)?;
    if let Some(matched) = &result.matched_dn {
        writeln!(out, "# matchedDN: {}", matched)?;
    }
    if let Some(text) = &result.diagnostic_message {
        writeln!(out, "# text: {}", text)?;
    }
    for referral in &result.referrals {
        writeln!(out, "# referral: {}", referral)?;
    }
    Ok(())
}
