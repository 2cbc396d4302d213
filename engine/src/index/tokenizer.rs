//! Text tokenization for full-text indexes.

use crate::error::Result;
use crate::{Error, Value};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;

/// Characters that separate tokens in addition to whitespace.
const PUNCTUATION: &[char] = &[
    '.', ',', ';', ':', '!', '?', '"', '\'', '(', ')', '[', ']', '{', '}', '<', '>', '/', '\\',
    '|', '-', '_', '+', '=', '*', '&', '^', '%', '$', '#', '@', '~', '`',
];

const WILDCARD: char = '*';

/// Languages with built-in stop word lists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    English,
    French,
    German,
    Spanish,
    Italian,
    Portuguese,
    Dutch,
}

impl Language {
    pub fn stop_words(&self) -> &'static [&'static str] {
        match self {
            Language::English => &[
                "a", "an", "and", "are", "as", "at", "be", "but", "by", "for", "if", "in",
                "into", "is", "it", "no", "not", "of", "on", "or", "such", "that", "the",
                "their", "then", "there", "these", "they", "this", "to", "was", "will", "with",
            ],
            Language::French => &[
                "au", "aux", "avec", "ce", "ces", "dans", "de", "des", "du", "elle", "en", "et",
                "il", "je", "la", "le", "les", "leur", "lui", "ma", "mais", "me", "mes", "ne",
                "nous", "on", "ou", "par", "pas", "pour", "qu", "que", "qui", "sa", "se", "ses",
                "son", "sur", "ta", "te", "tu", "un", "une", "vous",
            ],
            Language::German => &[
                "aber", "als", "am", "an", "auch", "auf", "aus", "bei", "das", "dass", "dem",
                "den", "der", "des", "die", "ein", "eine", "einem", "einen", "einer", "er", "es",
                "für", "hat", "ich", "im", "in", "ist", "mit", "nicht", "oder", "sie", "sind",
                "und", "von", "war", "wie", "zu", "zum", "zur",
            ],
            Language::Spanish => &[
                "al", "como", "con", "de", "del", "el", "ella", "en", "es", "esta", "este", "la",
                "las", "lo", "los", "más", "mi", "no", "para", "pero", "por", "que", "se", "si",
                "sin", "su", "sus", "un", "una", "uno", "y", "ya",
            ],
            Language::Italian => &[
                "a", "al", "alla", "che", "con", "da", "del", "della", "di", "e", "gli", "ha",
                "i", "il", "in", "la", "le", "lo", "ma", "mi", "nel", "non", "per", "più", "si",
                "sono", "su", "tra", "un", "una", "uno",
            ],
            Language::Portuguese => &[
                "a", "ao", "as", "com", "como", "da", "das", "de", "do", "dos", "e", "ela", "ele",
                "em", "na", "nas", "no", "nos", "não", "o", "os", "ou", "para", "pela", "pelo",
                "por", "que", "se", "sem", "um", "uma",
            ],
            Language::Dutch => &[
                "aan", "al", "als", "bij", "dat", "de", "die", "dit", "een", "en", "er", "het",
                "hij", "ik", "in", "is", "je", "met", "na", "naar", "niet", "of", "om", "op",
                "te", "tot", "uit", "van", "voor", "was", "wat", "ze", "zijn",
            ],
        }
    }
}

impl fmt::Display for Language {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Language::English => "english",
            Language::French => "french",
            Language::German => "german",
            Language::Spanish => "spanish",
            Language::Italian => "italian",
            Language::Portuguese => "portuguese",
            Language::Dutch => "dutch",
        };
        f.write_str(name)
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "english" | "en" => Ok(Language::English),
            "french" | "fr" => Ok(Language::French),
            "german" | "de" => Ok(Language::German),
            "spanish" | "es" => Ok(Language::Spanish),
            "italian" | "it" => Ok(Language::Italian),
            "portuguese" | "pt" => Ok(Language::Portuguese),
            "dutch" | "nl" => Ok(Language::Dutch),
            other => Err(format!("unsupported language '{other}'")),
        }
    }
}

/// A parsed full-text query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum TextQuery {
    /// Documents containing any of the tokens.
    Tokens(BTreeSet<String>),
    Prefix(String),
    Suffix(String),
    Contains(String),
}

impl TextQuery {
    pub(crate) fn matches_token(&self, token: &str) -> bool {
        match self {
            TextQuery::Tokens(tokens) => tokens.contains(token),
            TextQuery::Prefix(term) => token.starts_with(term.as_str()),
            TextQuery::Suffix(term) => token.ends_with(term.as_str()),
            TextQuery::Contains(term) => token.contains(term.as_str()),
        }
    }
}

/// Lowercases, splits on whitespace and punctuation, and drops stop words.
#[derive(Debug, Clone)]
pub struct TextTokenizer {
    languages: Vec<Language>,
    stop_words: HashSet<&'static str>,
}

impl TextTokenizer {
    pub fn new(languages: &[Language]) -> Self {
        let mut languages = languages.to_vec();
        if languages.is_empty() {
            languages.push(Language::English);
        }
        languages.sort();
        languages.dedup();
        let stop_words = languages
            .iter()
            .flat_map(|lang| lang.stop_words().iter().copied())
            .collect();
        Self {
            languages,
            stop_words,
        }
    }

    pub fn languages(&self) -> &[Language] {
        &self.languages
    }

    pub fn is_stop_word(&self, word: &str) -> bool {
        self.stop_words.contains(word)
    }

    fn is_separator(c: char) -> bool {
        c.is_whitespace() || PUNCTUATION.contains(&c)
    }

    /// Distinct tokens of a text.
    pub fn tokenize(&self, text: &str) -> BTreeSet<String> {
        text.to_lowercase()
            .split(Self::is_separator)
            .filter(|word| !word.is_empty() && !self.is_stop_word(word))
            .map(str::to_string)
            .collect()
    }

    /// Tokens of an indexed field value. Strings and arrays of strings are
    /// accepted; null or missing fields have no tokens.
    pub fn tokenize_value(&self, field: &str, value: Option<&Value>) -> Result<BTreeSet<String>> {
        match value {
            None | Some(Value::Null) => Ok(BTreeSet::new()),
            Some(Value::String(text)) => Ok(self.tokenize(text)),
            Some(Value::Array(items)) => {
                let mut tokens = BTreeSet::new();
                for item in items {
                    tokens.extend(self.tokenize_value(field, Some(item))?);
                }
                Ok(tokens)
            }
            Some(other) => Err(Error::Indexing(format!(
                "full-text index on '{field}' cannot index a {} value",
                other.kind_name()
            ))),
        }
    }

    /// Parse a search string.
    ///
    /// A single term may carry a leading and/or trailing `*`. A bare `*` or
    /// a wildcard in a multi-word query is rejected.
    pub(crate) fn parse_query(&self, query: &str) -> Result<TextQuery> {
        let query = query.trim();
        if !query.contains(WILDCARD) {
            return Ok(TextQuery::Tokens(self.tokenize(query)));
        }

        if query.chars().all(|c| c == WILDCARD) {
            return Err(Error::Validation(format!(
                "'{query}' is not a valid full-text search term"
            )));
        }
        if query.split_whitespace().count() > 1 {
            return Err(Error::Validation(format!(
                "wildcard is not supported in multi-word search '{query}'"
            )));
        }

        let leading = query.starts_with(WILDCARD);
        let trailing = query.ends_with(WILDCARD);
        let term = query.trim_matches(WILDCARD).to_lowercase();
        if term.contains(WILDCARD) {
            return Err(Error::Validation(format!(
                "wildcard is only supported at the start or end of '{query}'"
            )));
        }

        Ok(match (leading, trailing) {
            (true, true) => TextQuery::Contains(term),
            (true, false) => TextQuery::Suffix(term),
            _ => TextQuery::Prefix(term),
        })
    }

    /// Whether a field value satisfies a search string, without an index.
    pub fn matches(&self, field: &str, value: Option<&Value>, query: &str) -> Result<bool> {
        let query = self.parse_query(query)?;
        let tokens = match value {
            Some(Value::String(_)) | Some(Value::Array(_)) => {
                self.tokenize_value(field, value).unwrap_or_default()
            }
            _ => return Ok(false),
        };
        Ok(tokens.iter().any(|token| query.matches_token(token)))
    }
}

impl Default for TextTokenizer {
    fn default() -> Self {
        Self::new(&[Language::English])
    }
}
