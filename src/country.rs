// 🌍 Country Resolver - jurisdiction tokens → ISO 3166-1 alpha-2
//
// Registry records spell countries many ways: "US", "US-DE", "USA",
// "United States", "UK", "EL". All of them resolve to one ISO2 code.
// The ISO table itself comes from the isocountry crate.

use isocountry::CountryCode;

/// One ISO 3166-1 country
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Country {
    pub iso2: &'static str,
    pub iso3: &'static str,
    /// Common short name ("United Kingdom")
    pub name: &'static str,
    /// ISO name ("United Kingdom of Great Britain and Northern Ireland")
    pub official: &'static str,
}

impl Country {
    fn from_code(code: CountryCode) -> Self {
        let iso2 = code.alpha2();
        Country {
            iso2,
            iso3: code.alpha3(),
            name: short_name(iso2).unwrap_or_else(|| code.name()),
            official: code.name(),
        }
    }
}

/// Non-ISO codes that registries use anyway
const CODE_ALIASES: [(&str, &str); 2] = [("UK", "GB"), ("EL", "GR")];

/// Display names where the ISO name is too long or too formal
const SHORT_NAMES: [(&str, &str); 24] = [
    ("BO", "Bolivia"),
    ("BN", "Brunei"),
    ("CD", "DR Congo"),
    ("CG", "Republic of the Congo"),
    ("FM", "Micronesia"),
    ("GB", "United Kingdom"),
    ("IR", "Iran"),
    ("KP", "North Korea"),
    ("KR", "South Korea"),
    ("LA", "Laos"),
    ("MD", "Moldova"),
    ("PS", "Palestine"),
    ("RU", "Russia"),
    ("SY", "Syria"),
    ("TW", "Taiwan"),
    ("TZ", "Tanzania"),
    ("US", "United States"),
    ("VA", "Vatican City"),
    ("VE", "Venezuela"),
    ("VG", "British Virgin Islands"),
    ("VI", "United States Virgin Islands"),
    ("VN", "Vietnam"),
    ("XK", "Kosovo"),
    ("MK", "North Macedonia"),
];

/// Extra spellings seen in jurisdiction fields
const ALT_SPELLINGS: [(&str, &str); 24] = [
    ("usa", "US"),
    ("u.s.", "US"),
    ("u.s.a.", "US"),
    ("america", "US"),
    ("great britain", "GB"),
    ("britain", "GB"),
    ("england", "GB"),
    ("scotland", "GB"),
    ("wales", "GB"),
    ("northern ireland", "GB"),
    ("holland", "NL"),
    ("korea", "KR"),
    ("czech republic", "CZ"),
    ("czechia", "CZ"),
    ("ivory coast", "CI"),
    ("cote d'ivoire", "CI"),
    ("swaziland", "SZ"),
    ("eswatini", "SZ"),
    ("burma", "MM"),
    ("macedonia", "MK"),
    ("vatican", "VA"),
    ("turkey", "TR"),
    ("turkiye", "TR"),
    ("kosovo", "XK"),
];

fn short_name(iso2: &str) -> Option<&'static str> {
    SHORT_NAMES
        .iter()
        .find(|(code, _)| *code == iso2)
        .map(|(_, name)| *name)
}

fn is_two_letter_code(code: &str) -> bool {
    code.len() == 2 && code.bytes().all(|b| b.is_ascii_uppercase())
}

// ============================================================================
// COUNTRY RESOLVER
// ============================================================================

/// Resolves free-form country/jurisdiction tokens to ISO2 codes.
#[derive(Debug, Clone, Copy, Default)]
pub struct CountryResolver;

impl CountryResolver {
    pub fn new() -> Self {
        CountryResolver
    }

    /// Resolve a token to an ISO2 code, or None when unresolvable.
    ///
    /// Order: alias table, any two-letter code, ISO3, short/ISO/alternate name.
    /// A hyphenated token is tried whole first ("Guinea-Bissau"), then with
    /// its region suffix dropped ("US-DE" → "US").
    ///
    /// Two-letter codes are accepted as-is even when ISO has not assigned
    /// them ("XK"), so user-assigned registry codes still group by country.
    pub fn resolve(&self, candidate: &str) -> Option<String> {
        let value = candidate.trim();
        if value.is_empty() {
            return None;
        }

        if let Some(iso2) = self.resolve_token(value) {
            return Some(iso2);
        }

        match value.split_once('-') {
            Some((prefix, _)) => self.resolve_token(prefix.trim()),
            None => None,
        }
    }

    fn resolve_token(&self, value: &str) -> Option<String> {
        if value.is_empty() {
            return None;
        }
        let code = value.to_uppercase();

        if let Some((_, iso2)) = CODE_ALIASES.iter().find(|(alias, _)| *alias == code) {
            return Some(iso2.to_string());
        }

        if is_two_letter_code(&code) {
            return Some(code);
        }

        if code.len() == 3 {
            if let Ok(country) = CountryCode::for_alpha3(&code) {
                return Some(country.alpha2().to_string());
            }
        }

        let lower = value.to_lowercase();
        if let Some(iso2) = SHORT_NAMES
            .iter()
            .copied()
            .chain(ALT_SPELLINGS.iter().map(|&(spelling, iso2)| (iso2, spelling)))
            .find(|(_, name)| name.to_lowercase() == lower)
            .map(|(iso2, _)| iso2)
        {
            return Some(iso2.to_string());
        }

        CountryCode::iter()
            .find(|country| country.name().to_lowercase() == lower)
            .map(|country| country.alpha2().to_string())
    }

    /// ISO entry for a code; None for codes ISO has not assigned.
    pub fn by_iso2(&self, iso2: &str) -> Option<Country> {
        CountryCode::for_alpha2_caseless(iso2)
            .ok()
            .map(Country::from_code)
    }

    /// Display name for an ISO2 code; the code itself when unknown.
    pub fn country_name(&self, iso2: &str) -> String {
        let code = iso2.to_uppercase();
        if let Some(name) = short_name(&code) {
            return name.to_string();
        }
        self.by_iso2(&code)
            .map(|c| c.name.to_string())
            .unwrap_or(code)
    }
}

// ============================================================================
// TESTS
// ============================================================================
