//! The QEMU monitor control channel.
//!
//! Commands go through `virsh qemu-monitor-command`; replies come back as
//! JSON envelopes whose `return` member is either a number (for
//! `snapshot-create`) or a plain-text dump (for the human monitor
//! commands). The text parsers are line-oriented and case-insensitive for
//! register names, matching what the monitor actually prints.

use std::process::Command;

use crate::Error;

pub struct Qmp {
    domain: String,
}

impl Qmp {
    pub fn new(domain: &str) -> Self {
        Self {
            domain: domain.to_string(),
        }
    }

    /// Executes one monitor command and returns the raw reply.
    fn execute(&self, query: &str) -> Result<String, Error> {
        tracing::trace!(domain = %self.domain, query, "qmp");

        let output = Command::new("virsh")
            .args(["qemu-monitor-command", &self.domain, query])
            .output()?;

        if !output.status.success() {
            return Err(Error::Qmp(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let reply = String::from_utf8_lossy(&output.stdout).into_owned();
        if reply.is_empty() {
            // An empty reply carries no error indication of its own; the
            // command is treated as failed.
            return Err(Error::Qmp("empty reply".to_string()));
        }

        Ok(reply)
    }

    /// Dumps the vCPU registers as text.
    pub fn info_registers(&self) -> Result<String, Error> {
        self.execute(
            r#"{"execute": "human-monitor-command", "arguments": {"command-line": "info registers"}}"#,
        )
    }

    /// Asks the patched QEMU to start the unix-socket memory server.
    pub fn pmemaccess(&self, path: &str) -> Result<String, Error> {
        self.execute(&format!(
            r#"{{"execute": "pmemaccess", "arguments": {{"path": "{path}"}}}}"#,
        ))
    }

    /// Dumps `numwords` 32-bit words at a physical address.
    pub fn xp(&self, numwords: usize, paddr: u64) -> Result<String, Error> {
        self.execute(&format!(
            r#"{{"execute": "human-monitor-command", "arguments": {{"command-line": "xp /{numwords}wx 0x{paddr:x}"}}}}"#,
        ))
    }

    /// Asks the patched QEMU to freeze guest memory into a shared-memory
    /// object. Returns the snapshot size in bytes, or `None` when the
    /// hypervisor lacks the command.
    pub fn snapshot_create(&self, shm_name: &str) -> Result<Option<u64>, Error> {
        let reply = self.execute(&format!(
            r#"{{"execute": "snapshot-create", "arguments": {{"filename": "{shm_name}"}}}}"#,
        ))?;

        if reply.contains("CommandNotFound") {
            return Ok(None);
        }

        Ok(parse_return_number(&reply))
    }
}

/// Extracts a numeric `"return"` member from a QMP reply.
pub fn parse_return_number(reply: &str) -> Option<u64> {
    let value = reply.split("\"return\":").nth(1)?;
    let digits: String = value
        .trim_start()
        .chars()
        .take_while(char::is_ascii_digit)
        .collect();

    digits.parse().ok()
}

/// Checks that a reply signals plain success (`{"return": {}}` or similar,
/// anything without an `error` member).
pub fn reply_is_success(reply: &str) -> bool {
    reply.contains("\"return\"") && !reply.contains("\"error\"")
}

fn is_hex_digit(b: u8) -> bool {
    b.is_ascii_hexdigit()
}

/// Extracts the plain-text body out of a monitor reply envelope and turns
/// the JSON-escaped `\r`/`\n` sequences back into real line breaks. Text
/// that is not wrapped in an envelope passes through unchanged.
fn monitor_text(reply: &str) -> String {
    let body = match reply.split_once("\"return\":\"") {
        Some((_, rest)) => match rest.rfind('"') {
            Some(end) => &rest[..end],
            None => rest,
        },
        None => reply,
    };

    body.replace("\\r", "\r").replace("\\n", "\n")
}

/// Parses one register value out of an `info registers` dump.
///
/// Matches `NAME=hex` with optional spaces before the `=`, case
/// insensitively, at a token boundary (so `AX` does not match inside
/// `RAX`).
pub fn parse_register(dump: &str, name: &str) -> Option<u64> {
    let dump = monitor_text(dump);
    let bytes = dump.as_bytes();
    let name = name.as_bytes();

    let mut position = 0;
    while position + name.len() < bytes.len() {
        let window = &bytes[position..position + name.len()];

        if window.eq_ignore_ascii_case(name)
            && (position == 0 || !bytes[position - 1].is_ascii_alphanumeric())
        {
            let mut cursor = position + name.len();

            while cursor < bytes.len() && bytes[cursor] == b' ' {
                cursor += 1;
            }

            if cursor < bytes.len() && bytes[cursor] == b'=' {
                cursor += 1;

                let start = cursor;
                while cursor < bytes.len() && is_hex_digit(bytes[cursor]) {
                    cursor += 1;
                }

                if cursor > start {
                    return u64::from_str_radix(&dump[start..cursor], 16).ok();
                }
            }
        }

        position += 1;
    }

    None
}

/// Parses the base address of a segment register line: `GS =0018 <base> ...`.
pub fn parse_segment_base(dump: &str, name: &str) -> Option<u64> {
    let dump = monitor_text(dump);
    let position = dump
        .as_bytes()
        .windows(name.len())
        .position(|window| window.eq_ignore_ascii_case(name.as_bytes()))?;

    let rest = &dump[position + name.len()..];
    let rest = rest.trim_start().strip_prefix('=')?;

    // First token is the selector, second is the base.
    let mut tokens = rest.split_whitespace();
    let _selector = tokens.next()?;
    u64::from_str_radix(tokens.next()?, 16).ok()
}

/// Parses an `xp /Nwx` dump into bytes.
///
/// Lines have the form `<paddr>: 0x01234567 0x89abcdef ...`; the words are
/// little-endian in memory.
pub fn parse_xp(dump: &str, expected_words: usize) -> Option<Vec<u8>> {
    let dump = monitor_text(dump);
    let mut bytes = Vec::with_capacity(expected_words * 4);

    for line in dump.split(['\n', '\r']) {
        let line = line.trim();

        let (address, words) = match line.split_once(':') {
            Some(parts) => parts,
            None => continue,
        };

        let address = address.trim().trim_start_matches("0x");
        if address.is_empty() || !address.bytes().all(is_hex_digit) {
            continue;
        }

        for word in words.split_whitespace() {
            let word = word.strip_prefix("0x")?;
            let value = u32::from_str_radix(word, 16).ok()?;
            bytes.extend_from_slice(&value.to_le_bytes());
        }
    }

    if bytes.len() < expected_words * 4 {
        return None;
    }

    bytes.truncate(expected_words * 4);
    Some(bytes)
}

#[cfg(test)]
mod tests {
    use super::*;

    const REGISTERS_64: &str = concat!(
        "{\"return\":\"RAX=00000000fffe0000 RBX=ffff88007c0e6e00 ",
        "RCX=0000000000000000 RDX=0000000000000000\\r\\nRSI=0000000000000000 ",
        "RDI=ffff88007fc0d5c0 RBP=ffff88007b611e48 RSP=ffff88007b611e38\\r\\n",
        "RIP=ffffffff810301f5 RFL=00000246 [---Z-P-]\\r\\n",
        "ES =0000 0000000000000000 ffffffff 00000000\\r\\n",
        "FS =0000 00007f1234560000 ffffffff 00c00000\\r\\n",
        "GS =0000 ffff88007fc00000 ffffffff 00c00000\\r\\n",
        "CR0=8005003b CR2=00007f939a77f000 CR3=000000007b27a000 CR4=000006f0\\r\\n",
        "EFER=0000000000000d01\\r\\n\"}"
    );

    #[test]
    fn register_parsing_is_case_insensitive() {
        assert_eq!(
            parse_register(REGISTERS_64, "rax"),
            Some(0x00000000fffe0000)
        );
        assert_eq!(
            parse_register(REGISTERS_64, "RIP"),
            Some(0xffffffff810301f5)
        );
        assert_eq!(parse_register(REGISTERS_64, "CR3"), Some(0x7b27a000));
        assert_eq!(parse_register(REGISTERS_64, "EFER"), Some(0xd01));
    }

    #[test]
    fn register_names_match_at_token_boundaries() {
        // `AX` must not match the tail of `RAX`.
        assert_eq!(parse_register(REGISTERS_64, "AX"), None);

        // `R8` absent from this dump.
        assert_eq!(parse_register(REGISTERS_64, "R8"), None);
    }

    #[test]
    fn segment_base_parsing() {
        assert_eq!(
            parse_segment_base(REGISTERS_64, "GS"),
            Some(0xffff88007fc00000)
        );
        assert_eq!(
            parse_segment_base(REGISTERS_64, "FS"),
            Some(0x00007f1234560000)
        );
    }

    #[test]
    fn xp_parsing_assembles_little_endian_words() {
        let dump = concat!(
            "{\"return\":\"0000000000001000: 0x00abcdef 0x01020304 ",
            "0x00000000 0xffffffff\\r\\n\"}"
        );

        let bytes = parse_xp(dump, 4).expect("parsed dump");
        assert_eq!(bytes.len(), 16);
        assert_eq!(&bytes[0..4], &[0xef, 0xcd, 0xab, 0x00]);
        assert_eq!(&bytes[4..8], &[0x04, 0x03, 0x02, 0x01]);
        assert_eq!(&bytes[12..16], &[0xff, 0xff, 0xff, 0xff]);
    }

    #[test]
    fn truncated_xp_dump_is_rejected() {
        let dump = "{\"return\":\"0000000000001000: 0x00abcdef\\r\\n\"}";
        assert!(parse_xp(dump, 4).is_none());
    }

    #[test]
    fn snapshot_return_number() {
        assert_eq!(parse_return_number("{\"return\":2147483648}"), Some(1 << 31));
        assert_eq!(parse_return_number("{\"return\": 4096}"), Some(4096));
        assert_eq!(
            parse_return_number("{\"error\": {\"class\": \"CommandNotFound\"}}"),
            None
        );
    }
}
