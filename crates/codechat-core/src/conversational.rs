//! Small talk that should not trigger retrieval.
//!
//! Only messages that are nothing but a greeting, farewell or thanks
//! (plus punctuation and a few filler words) qualify, so a question such as
//! "hi, where is the router?" still goes through the full pipeline.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Conversational {
    Greeting,
    Farewell,
    Thanks,
}

const GREETINGS: &[&str] = &[
    "hello",
    "hi",
    "hey",
    "greetings",
    "howdy",
    "yo",
    "good morning",
    "good afternoon",
    "good evening",
];

const FAREWELLS: &[&str] = &[
    "bye",
    "goodbye",
    "bye bye",
    "see you",
    "see ya",
    "farewell",
    "take care",
    "cya",
    "later",
    "good night",
];

const THANKS: &[&str] = &["thanks", "thank you", "thx", "ty", "cheers", "much appreciated"];

/// Words allowed after the phrase without turning it into a question.
const FILLERS: &[&str] = &[
    "there", "all", "everyone", "again", "so", "much", "a", "lot", "very", "you", "for", "now",
    "later", "codechat", "bot", "friend", "folks",
];

const MAX_FILLERS: usize = 3;

impl Conversational {
    pub fn detect(query: &str) -> Option<Self> {
        let words: Vec<String> = query
            .to_lowercase()
            .split(|c: char| !(c.is_alphanumeric() || c == '\''))
            .filter(|w| !w.is_empty())
            .map(str::to_string)
            .collect();
        if words.is_empty() {
            return None;
        }

        let families = [
            (Conversational::Greeting, GREETINGS),
            (Conversational::Farewell, FAREWELLS),
            (Conversational::Thanks, THANKS),
        ];
        for (kind, phrases) in families {
            for phrase in phrases.iter() {
                let phrase_words: Vec<&str> = phrase.split(' ').collect();
                if words.len() < phrase_words.len() {
                    continue;
                }
                let (head, tail) = words.split_at(phrase_words.len());
                if head.iter().zip(&phrase_words).all(|(w, p)| w == p)
                    && tail.len() <= MAX_FILLERS
                    && tail.iter().all(|w| FILLERS.contains(&w.as_str()))
                {
                    return Some(kind);
                }
            }
        }
        None
    }

    pub fn response(&self) -> &'static str {
        match self {
            Conversational::Greeting => {
                "Hello! I'm CodeChat. Ask me anything about the indexed repository, \
for example \"What are the main functions?\" or \"How does the config loader work?\""
            }
            Conversational::Farewell => {
                "Goodbye! Come back any time you have questions about the code."
            }
            Conversational::Thanks => {
                "You're welcome! Let me know if there's anything else in the code you'd like explained."
            }
        }
    }
}
