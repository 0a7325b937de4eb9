//! User identity lines: `<name> <SP> < <email> > <SP> <timestamp> <SP> <tz-offset>`.
//!
//! Used for the author/committer lines of a commit and the tagger line of a
//! tag. Splitting an existing line into name/email is deliberately lax (see
//! the "user string structure" design note): it accepts legacy input that
//! wouldn't round-trip cleanly through a strict grammar.

use bstr::{BString, ByteSlice};

/// A point in time with a fixed UTC offset, exactly as git records it: a
/// Unix timestamp plus a signed offset in minutes from UTC. This is not a
/// timezone name or a `chrono` timezone; it is the raw offset git writes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Instant {
    pub seconds: i64,
    pub tz_offset_minutes: i32,
}

impl Instant {
    pub fn new(seconds: i64, tz_offset_minutes: i32) -> Self {
        Self {
            seconds,
            tz_offset_minutes,
        }
    }

    /// Parse `"<unix-seconds> <+HHMM|-HHMM>"`. Returns `None` if either
    /// field is malformed; callers treat that as "no instant recorded"
    /// rather than a hard error, matching this format's general leniency.
    pub fn parse(s: &[u8]) -> Option<Self> {
        let s = s.trim();
        let mut parts = s.splitn_str(2, " ");
        let ts_raw = parts.next()?;
        let tz_raw = parts.next()?;

        let ts_str = std::str::from_utf8(ts_raw).ok()?;
        let seconds: i64 = ts_str.parse().ok()?;

        let tz_offset_minutes = parse_tz_offset(tz_raw)?;
        Some(Self {
            seconds,
            tz_offset_minutes,
        })
    }

    pub fn to_bytes(&self) -> BString {
        let mut out = format!("{} ", self.seconds).into_bytes();
        out.extend_from_slice(&format_tz_offset(self.tz_offset_minutes));
        BString::from(out)
    }
}

/// Parse a git-style `+HHMM` / `-HHMM` timezone offset into signed minutes.
fn parse_tz_offset(raw: &[u8]) -> Option<i32> {
    if raw.len() != 5 {
        return None;
    }
    let sign = match raw[0] {
        b'+' => 1i32,
        b'-' => -1i32,
        _ => return None,
    };
    let digits = std::str::from_utf8(&raw[1..]).ok()?;
    if digits.len() != 4 || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    let hours: i32 = digits[0..2].parse().ok()?;
    let minutes: i32 = digits[2..4].parse().ok()?;
    Some(sign * (hours * 60 + minutes))
}

fn format_tz_offset(total_minutes: i32) -> BString {
    let sign = if total_minutes < 0 { '-' } else { '+' };
    let abs = total_minutes.unsigned_abs();
    let hours = abs / 60;
    let minutes = abs % 60;
    BString::from(format!("{sign}{hours:02}{minutes:02}"))
}

/// An author, committer, or tagger identity line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    pub name: BString,
    pub email: BString,
    pub when: Instant,
}

impl Signature {
    pub fn new(name: impl Into<BString>, email: impl Into<BString>, when: Instant) -> Self {
        Self {
            name: name.into(),
            email: email.into(),
            when,
        }
    }

    /// Best-effort split per the lax user-string structure: find the first
    /// `<`; its trimmed prefix is the name; find the next `>`; everything
    /// between is the email; whatever follows is parsed as an [`Instant`].
    /// Never fails — inputs that don't fit the pattern still produce a
    /// `Signature`, just with an empty email and/or a zero instant.
    pub fn parse(input: &[u8]) -> Self {
        let Some(lt) = input.find_byte(b'<') else {
            return Self {
                name: BString::from(input.trim().to_vec()),
                email: BString::default(),
                when: Instant::new(0, 0),
            };
        };

        let name = BString::from(input[..lt].trim_end().to_vec());
        let rest = &input[lt + 1..];

        let Some(gt) = rest.find_byte(b'>') else {
            return Self {
                name,
                email: BString::from(rest.trim().to_vec()),
                when: Instant::new(0, 0),
            };
        };

        let email = BString::from(rest[..gt].to_vec());
        let tail = &rest[gt + 1..];
        let when = Instant::parse(tail).unwrap_or(Instant::new(0, 0));

        Self { name, email, when }
    }

    pub fn to_bytes(&self) -> BString {
        let mut out = Vec::new();
        out.extend_from_slice(&self.name);
        out.extend_from_slice(b" <");
        out.extend_from_slice(&self.email);
        out.extend_from_slice(b"> ");
        out.extend_from_slice(&self.when.to_bytes());
        BString::from(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_full_signature() {
        let sig = Signature::parse(b"Ross Light <ross@zombiezen.com> 1594510150 -0700");
        assert_eq!(sig.name.as_slice(), b"Ross Light");
        assert_eq!(sig.email.as_slice(), b"ross@zombiezen.com");
        assert_eq!(sig.when.seconds, 1594510150);
        assert_eq!(sig.when.tz_offset_minutes, -420);
    }

    #[test]
    fn roundtrip() {
        let sig = Signature::new("Ross Light", "ross@zombiezen.com", Instant::new(1594510150, -420));
        let bytes = sig.to_bytes();
        assert_eq!(sig, Signature::parse(&bytes));
    }

    #[test]
    fn positive_offset() {
        let sig = Signature::parse(b"A U Thor <author@example.com> 1112354055 +0200");
        assert_eq!(sig.when.tz_offset_minutes, 120);
    }

    #[test]
    fn lax_split_takes_first_angle_bracket() {
        // Legacy/odd input with a stray '<' before the real email. Confirms
        // we split on the *first* '<' then the *next* '>', per this format's
        // literal algorithm, rather than the last '>'/'<' pair.
        let sig = Signature::parse(b"Weird <Name> <weird@example.com> 0 +0000");
        assert_eq!(sig.name.as_slice(), b"Weird");
        assert_eq!(sig.email.as_slice(), b"Name");
    }

    #[test]
    fn missing_angle_brackets_still_parses() {
        let sig = Signature::parse(b"Just A Name");
        assert_eq!(sig.name.as_slice(), b"Just A Name");
        assert_eq!(sig.email.as_slice(), b"");
        assert_eq!(sig.when, Instant::new(0, 0));
    }

    #[test]
    fn tz_offset_roundtrip() {
        for m in [0, 60, -60, 330, -330, 720, -720] {
            assert_eq!(parse_tz_offset(&format_tz_offset(m)), Some(m));
        }
    }
}
