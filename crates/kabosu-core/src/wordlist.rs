//! BIP-39 wordlist catalog
//!
//! The ten builtin languages resolve to the `bip39` crate's static 2048-word
//! tables; a custom list can be loaded from a newline-separated file. Word
//! lookup is a binary search for English (the list is sorted) and a linear
//! scan otherwise.

use crate::mnemonic::MnemonicError;
use std::fs;
use std::path::Path;

pub const WORDLIST_LEN: usize = 2048;

/// Builtin languages, addressed by their ISO 639-2-style codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Language {
    English,
    Japanese,
    Spanish,
    ChineseSimplified,
    ChineseTraditional,
    French,
    Italian,
    Korean,
    Czech,
    Portuguese,
}

impl Language {
    pub fn from_code(code: &str) -> Result<Language, MnemonicError> {
        Ok(match code {
            "eng" => Language::English,
            "jpn" => Language::Japanese,
            "spa" => Language::Spanish,
            "sc" => Language::ChineseSimplified,
            "tc" => Language::ChineseTraditional,
            "fra" => Language::French,
            "ita" => Language::Italian,
            "kor" => Language::Korean,
            "cze" => Language::Czech,
            "por" => Language::Portuguese,
            _ => return Err(MnemonicError::UnsupportedLanguage(code.to_string())),
        })
    }

    fn to_bip39(self) -> bip39::Language {
        match self {
            Language::English => bip39::Language::English,
            Language::Japanese => bip39::Language::Japanese,
            Language::Spanish => bip39::Language::Spanish,
            Language::ChineseSimplified => bip39::Language::SimplifiedChinese,
            Language::ChineseTraditional => bip39::Language::TraditionalChinese,
            Language::French => bip39::Language::French,
            Language::Italian => bip39::Language::Italian,
            Language::Korean => bip39::Language::Korean,
            Language::Czech => bip39::Language::Czech,
            Language::Portuguese => bip39::Language::Portuguese,
        }
    }

    fn words(self) -> &'static [&'static str] {
        // the empty prefix matches the whole table
        self.to_bip39().words_by_prefix("")
    }

    /// Words are joined with an ideographic space on the Japanese list.
    pub fn delimiter(self) -> char {
        match self {
            Language::Japanese => '\u{3000}',
            _ => ' ',
        }
    }
}

/// A resolved 2048-entry wordlist.
pub enum Wordlist {
    Builtin(Language),
    Custom(Vec<String>),
}

impl Wordlist {
    pub fn builtin(language: Language) -> Wordlist {
        Wordlist::Builtin(language)
    }

    /// Load a newline-separated 2048-word file.
    pub fn from_file(path: &Path) -> Result<Wordlist, MnemonicError> {
        let contents =
            fs::read_to_string(path).map_err(|e| MnemonicError::WordlistInvalid(e.to_string()))?;
        let words: Vec<String> = contents
            .lines()
            .map(|line| line.trim().to_string())
            .filter(|line| !line.is_empty())
            .collect();
        if words.len() != WORDLIST_LEN {
            return Err(MnemonicError::WordlistInvalid(format!(
                "expected {} words, found {}",
                WORDLIST_LEN,
                words.len()
            )));
        }
        Ok(Wordlist::Custom(words))
    }

    pub fn word(&self, index: usize) -> Option<&str> {
        match self {
            Wordlist::Builtin(lang) => lang.words().get(index).copied(),
            Wordlist::Custom(words) => words.get(index).map(String::as_str),
        }
    }

    /// Index of `word`, if present.
    pub fn find(&self, word: &str) -> Option<u16> {
        match self {
            Wordlist::Builtin(Language::English) => {
                // the English list is sorted
                Language::English
                    .words()
                    .binary_search_by(|probe| probe.cmp(&word))
                    .ok()
                    .map(|i| i as u16)
            }
            Wordlist::Builtin(lang) => lang
                .words()
                .iter()
                .position(|w| *w == word)
                .map(|i| i as u16),
            Wordlist::Custom(words) => words
                .iter()
                .position(|w| w == word)
                .map(|i| i as u16),
        }
    }

    /// First word starting with `prefix` (linear, returns the first match).
    pub fn complete(&self, prefix: &str) -> Option<&str> {
        match self {
            Wordlist::Builtin(lang) => lang
                .words()
                .iter()
                .find(|w| w.starts_with(prefix))
                .copied(),
            Wordlist::Custom(words) => words
                .iter()
                .find(|w| w.starts_with(prefix))
                .map(String::as_str),
        }
    }

    pub fn delimiter(&self) -> char {
        match self {
            Wordlist::Builtin(lang) => lang.delimiter(),
            Wordlist::Custom(_) => ' ',
        }
    }

    /// Bitmask of the letters (`a`..`z`) that can follow `prefix` in some
    /// word of the list; with an empty prefix every letter is offered.
    pub fn completion_mask(&self, prefix: &str) -> u32 {
        if prefix.is_empty() {
            return 0x03ff_ffff;
        }
        let mut mask = 0u32;
        for index in 0..WORDLIST_LEN {
            let Some(word) = self.word(index) else {
                break;
            };
            if let Some(rest) = word.strip_prefix(prefix) {
                if let Some(next) = rest.bytes().next() {
                    if next.is_ascii_lowercase() {
                        mask |= 1 << (next - b'a');
                    }
                }
            }
        }
        mask
    }
}
