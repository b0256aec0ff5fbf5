// 🧹 Name Normalizer - canonical form of a legal entity name
//
// "Apple Inc." / "APPLE, INC" / "apple" → "apple"
// Legal-form suffixes carry no identity, so they are dropped token by token.

/// Legal-form tokens removed after cleaning
const LEGAL_FORMS: [&str; 22] = [
    "inc", "inc.", "corp", "corp.", "corporation", "co", "co.", "company", "ltd", "ltd.",
    "limited", "llc", "plc", "gmbh", "ag", "s.a.", "s.a", "sa", "srl", "bv", "oy", "ab",
];

pub fn is_legal_form(token: &str) -> bool {
    LEGAL_FORMS.contains(&token)
}

/// Canonicalize a raw entity name.
///
/// Lowercases, spells out `&`, blanks everything that is not an ASCII letter,
/// digit, whitespace, period or hyphen, collapses whitespace and strips legal
/// forms. Accented letters are blanked too ("Société" → "soci t").
pub fn normalize_name(raw: &str) -> String {
    let lowered = raw.to_lowercase().replace('&', " and ");

    let cleaned: String = lowered
        .chars()
        .map(|c| {
            if c.is_ascii_lowercase() || c.is_ascii_digit() || c == '.' || c == '-' {
                c
            } else {
                ' '
            }
        })
        .collect();

    cleaned
        .split_whitespace()
        .filter(|token| !is_legal_form(token))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Normalize, then split on whitespace.
pub fn tokenize(raw: &str) -> Vec<String> {
    normalize_name(raw)
        .split_whitespace()
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_strips_legal_forms() {
        assert_eq!(normalize_name("Apple Inc."), "apple");
        assert_eq!(normalize_name("Microsoft Corporation"), "microsoft");
        assert_eq!(normalize_name("Siemens AG"), "siemens");
        assert_eq!(normalize_name("Nestlé S.A."), "nestl");
        assert_eq!(normalize_name("Tesla, Inc."), "tesla");
    }

    #[test]
    fn test_ampersand_and_punctuation() {
        assert_eq!(normalize_name("Johnson & Johnson"), "johnson and johnson");
        assert_eq!(normalize_name("AT&T Inc."), "at and t");
        assert_eq!(normalize_name("Amazon.com, Inc."), "amazon.com");
        assert_eq!(normalize_name("Coca-Cola Co"), "coca-cola");
        assert_eq!(normalize_name("  Foo   (Holdings)  Ltd "), "foo holdings");
    }

    #[test]
    fn test_non_ascii_letters_are_blanked() {
        assert_eq!(normalize_name("Société Générale"), "soci t g n rale");
        assert_eq!(normalize_name("Deutsche Börse AG"), "deutsche b rse");
        assert_eq!(normalize_name("ÅB Ørsted"), "b rsted");
        assert_eq!(normalize_name("北京银行"), "");
    }

    #[test]
    fn test_empty_and_only_suffixes() {
        assert_eq!(normalize_name(""), "");
        assert_eq!(normalize_name("   "), "");
        assert_eq!(normalize_name("Inc. Ltd"), "");
        assert!(tokenize("!!!").is_empty());
    }

    #[test]
    fn test_idempotent() {
        let samples = [
            "Apple Inc.",
            "Johnson & Johnson",
            "Amazon.com, Inc.",
            "BANCO SANTANDER, S.A.",
            "Société Générale",
            "  co co  co. ",
            "Deutsche Bank AG & Co KGaA",
        ];
        for raw in samples {
            let once = normalize_name(raw);
            assert_eq!(normalize_name(&once), once, "not idempotent for {:?}", raw);
        }
    }

    #[test]
    fn test_tokenize() {
        assert_eq!(tokenize("Meta Platforms, Inc."), vec!["meta", "platforms"]);
        assert_eq!(tokenize("Bank of America N.A."), vec!["bank", "of", "america", "n.a."]);
    }
}
