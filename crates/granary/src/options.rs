//! Option-line parsing for the command plane.
//!
//! The accepted forms are `--name`, `--name=value` and
//! `--name=[literal value with spaces]`. Names are `[A-Za-z_]+`; values are
//! printable ASCII excluding the brackets. Booleans accept `1`/`0`,
//! `y`/`n`, `t`/`f` or presence alone, and every `--name` has a parallel
//! `--no_name` form that sets it false. Anything unrecognised is silently
//! ignored — clients query only the names they know.

use std::collections::HashMap;

/// A parsed option line.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Options {
    values: HashMap<String, String>,
}

fn is_name_byte(b: u8) -> bool {
    b.is_ascii_alphabetic() || b == b'_'
}

fn is_value_byte(b: u8) -> bool {
    (0x20..0x7F).contains(&b) && b != b'[' && b != b']'
}

impl Options {
    /// Parse an option line. Malformed fragments are skipped, never
    /// reported: unknown or broken options must not wedge the command
    /// plane.
    pub fn parse(line: &str) -> Options {
        let mut values = HashMap::new();
        let bytes = line.as_bytes();
        let mut i = 0usize;

        while i < bytes.len() {
            // Find the next `--`.
            if bytes[i] != b'-' || i + 1 >= bytes.len() || bytes[i + 1] != b'-' {
                i += 1;
                continue;
            }
            i += 2;

            let name_start = i;
            while i < bytes.len() && is_name_byte(bytes[i]) {
                i += 1;
            }
            if i == name_start {
                continue;
            }
            let name = &line[name_start..i];

            // Presence-only form.
            if i >= bytes.len() || bytes[i] != b'=' {
                insert(&mut values, name, "1");
                continue;
            }
            i += 1;

            // Bracketed literal value.
            if i < bytes.len() && bytes[i] == b'[' {
                i += 1;
                let value_start = i;
                while i < bytes.len() && bytes[i] != b']' {
                    if !is_value_byte(bytes[i]) && bytes[i] != b' ' {
                        break;
                    }
                    i += 1;
                }
                if i < bytes.len() && bytes[i] == b']' {
                    insert(&mut values, name, &line[value_start..i]);
                    i += 1;
                }
                continue;
            }

            // Plain value up to whitespace.
            let value_start = i;
            while i < bytes.len() && bytes[i] != b' ' && is_value_byte(bytes[i]) {
                i += 1;
            }
            insert(&mut values, name, &line[value_start..i]);
        }

        Options { values }
    }

    /// The raw value of `name`, if present.
    pub fn value(&self, name: &str) -> Option<&str> {
        self.values.get(name).map(String::as_str)
    }

    /// The boolean interpretation of `name`: the positive forms, the
    /// negative forms, and the `--no_name` override.
    pub fn flag(&self, name: &str) -> Option<bool> {
        if self.values.contains_key(&format!("no_{name}")) {
            return Some(false);
        }
        let value = self.values.get(name)?;
        match value.as_str() {
            "1" | "y" | "t" | "yes" | "true" => Some(true),
            "0" | "n" | "f" | "no" | "false" => Some(false),
            _ => Some(true),
        }
    }

    /// Is the option line empty?
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// The `--no_name` form records under its full name so `flag` can find it;
/// everything else records verbatim.
fn insert(values: &mut HashMap<String, String>, name: &str, value: &str) {
    values.insert(name.to_owned(), value.to_owned());
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn the_three_forms() {
        let opts = Options::parse("--count_blocks --output=trace.log --note=[hello there]");
        assert_eq!(opts.flag("count_blocks"), Some(true));
        assert_eq!(opts.value("output"), Some("trace.log"));
        assert_eq!(opts.value("note"), Some("hello there"));
    }

    #[test]
    fn boolean_spellings() {
        for (spelling, expected) in [
            ("--x=1", true),
            ("--x=0", false),
            ("--x=y", true),
            ("--x=n", false),
            ("--x=t", true),
            ("--x=f", false),
            ("--x", true),
        ] {
            assert_eq!(Options::parse(spelling).flag("x"), Some(expected), "{spelling}");
        }
    }

    #[test]
    fn no_prefix_negates() {
        let opts = Options::parse("--no_verbose");
        assert_eq!(opts.flag("verbose"), Some(false));
    }

    #[test]
    fn unknown_and_malformed_are_ignored() {
        let opts = Options::parse("garbage --=x ---- --ok=1 --broken=[unterminated");
        assert_eq!(opts.flag("ok"), Some(true));
        assert_eq!(opts.value("broken"), None);
        assert_eq!(opts.value("garbage"), None);
    }

    #[test]
    fn absent_options_are_none() {
        let opts = Options::parse("--present");
        assert_eq!(opts.flag("absent"), None);
        assert_eq!(opts.value("absent"), None);
    }
}
