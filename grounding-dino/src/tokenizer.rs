use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result, bail};

/// Greedy WordPiece tokenizer over the BERT vocabulary shipped with the
/// GroundingDINO checkpoint. Only the encoding direction is needed: the text
/// branch of the model consumes token ids, and phrase extraction maps logit
/// positions back to the token strings.
#[derive(Debug)]
pub struct WordPieceTokenizer {
    vocab: HashMap<String, i64>,
    unk_id: i64,
    cls_id: i64,
    sep_id: i64,
}

/// Tokenized prompt, ids and token strings aligned index-for-index
/// (including the [CLS]/[SEP] framing).
#[derive(Debug, Clone)]
pub struct Encoding {
    pub ids: Vec<i64>,
    pub tokens: Vec<String>,
}

const MAX_WORD_CHARS: usize = 100;

impl WordPieceTokenizer {
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read vocab file: {}", path.display()))?;
        Self::from_vocab(text.lines())
    }

    pub fn from_vocab<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Self> {
        let vocab: HashMap<String, i64> = lines
            .enumerate()
            .map(|(i, token)| (token.trim_end().to_string(), i as i64))
            .collect();

        let lookup = |token: &str| -> Result<i64> {
            match vocab.get(token) {
                Some(&id) => Ok(id),
                None => bail!("Vocabulary is missing the {token} token"),
            }
        };

        let unk_id = lookup("[UNK]")?;
        let cls_id = lookup("[CLS]")?;
        let sep_id = lookup("[SEP]")?;

        Ok(Self {
            vocab,
            unk_id,
            cls_id,
            sep_id,
        })
    }

    /// Encode a caption into `[CLS] tokens... [SEP]`.
    pub fn encode(&self, text: &str) -> Encoding {
        let mut ids = vec![self.cls_id];
        let mut tokens = vec!["[CLS]".to_string()];

        for word in split_words(text) {
            for (id, token) in self.wordpiece(&word) {
                ids.push(id);
                tokens.push(token);
            }
        }

        ids.push(self.sep_id);
        tokens.push("[SEP]".to_string());

        Encoding { ids, tokens }
    }

    pub fn is_special(&self, id: i64) -> bool {
        id == self.cls_id || id == self.sep_id
    }

    /// Greedy longest-match subword split; unknown words collapse to [UNK].
    fn wordpiece(&self, word: &str) -> Vec<(i64, String)> {
        if word.chars().count() > MAX_WORD_CHARS {
            return vec![(self.unk_id, "[UNK]".to_string())];
        }

        let chars: Vec<char> = word.chars().collect();
        let mut pieces = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let mut end = chars.len();
            let mut matched = None;

            while end > start {
                let mut piece: String = chars[start..end].iter().collect();
                if start > 0 {
                    piece = format!("##{piece}");
                }
                if let Some(&id) = self.vocab.get(&piece) {
                    matched = Some((id, piece));
                    break;
                }
                end -= 1;
            }

            match matched {
                Some(found) => {
                    pieces.push(found);
                    start = end;
                }
                None => return vec![(self.unk_id, "[UNK]".to_string())],
            }
        }

        pieces
    }
}

/// Lowercase and split into words, treating each punctuation character as its
/// own token the way BERT's basic tokenizer does.
fn split_words(text: &str) -> Vec<String> {
    let mut words = Vec::new();
    let mut current = String::new();

    for c in text.to_lowercase().chars() {
        if c.is_whitespace() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
        } else if c.is_ascii_punctuation() {
            if !current.is_empty() {
                words.push(std::mem::take(&mut current));
            }
            words.push(c.to_string());
        } else {
            current.push(c);
        }
    }

    if !current.is_empty() {
        words.push(current);
    }

    words
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tokenizer() -> WordPieceTokenizer {
        let vocab = ["[PAD]", "[UNK]", "[CLS]", "[SEP]", "a", "tree", "house", "##boat", "."];
        WordPieceTokenizer::from_vocab(vocab.into_iter()).unwrap()
    }

    #[test]
    fn encodes_with_special_token_framing() {
        let encoding = tokenizer().encode("a tree.");
        assert_eq!(encoding.tokens, ["[CLS]", "a", "tree", ".", "[SEP]"]);
        assert_eq!(encoding.ids, [2, 4, 5, 8, 3]);
    }

    #[test]
    fn splits_subwords_greedily() {
        let encoding = tokenizer().encode("houseboat");
        assert_eq!(encoding.tokens, ["[CLS]", "house", "##boat", "[SEP]"]);
    }

    #[test]
    fn unknown_words_collapse_to_unk() {
        let encoding = tokenizer().encode("zzz");
        assert_eq!(encoding.tokens, ["[CLS]", "[UNK]", "[SEP]"]);
        assert_eq!(encoding.ids[1], 1);
    }

    #[test]
    fn lowercases_and_separates_punctuation() {
        let words = split_words("A Tree, house.");
        assert_eq!(words, ["a", "tree", ",", "house", "."]);
    }

    #[test]
    fn special_ids_are_flagged() {
        let t = tokenizer();
        assert!(t.is_special(2));
        assert!(t.is_special(3));
        assert!(!t.is_special(4));
    }

    #[test]
    fn missing_special_token_is_an_error() {
        let result = WordPieceTokenizer::from_vocab(["a", "b"].into_iter());
        assert!(result.is_err());
    }
}
