// SPDX-License-Identifier: AGPL-3.0-only
// Copyright (C) 2026 Alex Sizykh

/// Single-quote escaper shared by every command sent to the login node.
pub fn sh_escape(arg: &str) -> String {
    let mut out = String::from("'");
    out.push_str(&arg.replace('\'', r"'\''"));
    out.push('\'');
    out
}

#[cfg(test)]
mod tests {
    use super::sh_escape;

    #[test]
    fn wraps_plain_values() {
        assert_eq!(sh_escape("/scratch/a b"), "'/scratch/a b'");
    }

    #[test]
    fn escapes_embedded_quotes() {
        assert_eq!(sh_escape("it's"), r"'it'\''s'");
    }

    #[test]
    fn neutralizes_substitutions() {
        assert_eq!(sh_escape("$(rm -rf ~)"), "'$(rm -rf ~)'");
    }
}
