//! tagged reply decoding.
//!
//! persona prompts ask the model to answer in four sections:
//!
//! ```text
//! <question_analysis>...</question_analysis>
//! <answer>...</answer>
//! <suggested_documents>...</suggested_documents>
//! <citations>...</citations>
//! ```
//!
//! decoding is best-effort: a missing or malformed section is an empty string,
//! never an error, so every reply can still land in the transcript.

use serde::{Deserialize, Serialize};

/// the four sections of a tagged reply, in prompt order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Section {
    QuestionAnalysis,
    Answer,
    SuggestedDocuments,
    Citations,
}

impl Section {
    pub const ALL: [Section; 4] = [
        Section::QuestionAnalysis,
        Section::Answer,
        Section::SuggestedDocuments,
        Section::Citations,
    ];

    /// the tag name, also the serialized key.
    pub fn tag(self) -> &'static str {
        match self {
            Section::QuestionAnalysis => "question_analysis",
            Section::Answer => "answer",
            Section::SuggestedDocuments => "suggested_documents",
            Section::Citations => "citations",
        }
    }
}

/// one decoded persona reply. always carries all four sections.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DecodedResponse {
    pub question_analysis: String,
    pub answer: String,
    pub suggested_documents: String,
    pub citations: String,
}

impl DecodedResponse {
    pub fn get(&self, section: Section) -> &str {
        match section {
            Section::QuestionAnalysis => &self.question_analysis,
            Section::Answer => &self.answer,
            Section::SuggestedDocuments => &self.suggested_documents,
            Section::Citations => &self.citations,
        }
    }

    fn slot_mut(&mut self, section: Section) -> &mut String {
        match section {
            Section::QuestionAnalysis => &mut self.question_analysis,
            Section::Answer => &mut self.answer,
            Section::SuggestedDocuments => &mut self.suggested_documents,
            Section::Citations => &mut self.citations,
        }
    }

    /// true when nothing could be decoded.
    pub fn is_empty(&self) -> bool {
        Section::ALL.iter().all(|s| self.get(*s).is_empty())
    }

    /// sections that decoded to non-empty text.
    pub fn present(&self) -> Vec<Section> {
        Section::ALL
            .into_iter()
            .filter(|s| !self.get(*s).is_empty())
            .collect()
    }

    /// writes the sections back as a tagged reply. handy for fixtures:
    /// `decode(&r.encode()) == r` for any already-trimmed `r`.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        for section in Section::ALL {
            let tag = section.tag();
            out.push_str(&format!("<{tag}>{}</{tag}>\n", self.get(section)));
        }
        out
    }
}

/// extracts the text between the first `<tag>` and the first `</tag>`.
fn extract(raw: &str, tag: &str) -> String {
    let open = format!("<{tag}>");
    let close = format!("</{tag}>");
    let (Some(start), Some(end)) = (raw.find(&open), raw.find(&close)) else {
        return String::new();
    };
    let body_start = start + open.len();
    // reversed markers decode to nothing
    if end < body_start {
        return String::new();
    }
    raw[body_start..end].trim().to_string()
}

/// decodes a raw model reply. never fails; unknown text yields empty sections.
pub fn decode(raw: &str) -> DecodedResponse {
    let mut out = DecodedResponse::default();
    for section in Section::ALL {
        *out.slot_mut(section) = extract(raw, section.tag());
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn empty_input_decodes_to_empty_sections() {
        let r = decode("");
        assert_eq!(r, DecodedResponse::default());
        assert!(r.is_empty());
    }

    #[test]
    fn single_section() {
        let r = decode("<answer>Hi</answer>");
        assert_eq!(r.answer, "Hi");
        assert_eq!(r.question_analysis, "");
        assert_eq!(r.suggested_documents, "");
        assert_eq!(r.citations, "");
        assert_eq!(r.present(), vec![Section::Answer]);
    }

    #[test]
    fn sections_in_any_order() {
        let r = decode("<answer>A</answer>before<question_analysis>Q</question_analysis>");
        assert_eq!(r.answer, "A");
        assert_eq!(r.question_analysis, "Q");
    }

    #[test]
    fn reversed_markers_are_empty() {
        let r = decode("</answer>X<answer>");
        assert_eq!(r.answer, "");
    }

    #[test]
    fn missing_end_marker_is_empty() {
        let r = decode("<citations>[1] letters, 1971");
        assert_eq!(r.citations, "");
    }

    #[test]
    fn only_first_occurrence_counts() {
        let r = decode("<answer> one </answer><answer>two</answer>");
        assert_eq!(r.answer, "one");

        // first close comes before the second open; body spans to the first close
        let r = decode("<answer>a<answer>b</answer>");
        assert_eq!(r.answer, "a<answer>b");
    }

    #[test]
    fn trims_surrounding_whitespace() {
        let raw = "<question_analysis>\n  asks about 1970  \n</question_analysis>";
        assert_eq!(decode(raw).question_analysis, "asks about 1970");
    }

    #[test]
    fn markers_are_case_sensitive() {
        let r = decode("<Answer>nope</Answer>");
        assert!(r.is_empty());
    }

    #[test]
    fn garbage_still_has_all_four_keys() {
        let r = decode("no tags at all, just <b>html</b> and </ broken <");
        let json = serde_json::to_value(&r).unwrap();
        let obj = json.as_object().unwrap();
        assert_eq!(obj.len(), 4);
        for section in Section::ALL {
            assert_eq!(obj[section.tag()], "");
        }
    }

    #[test]
    fn handles_multibyte_text() {
        let r = decode("<answer>¿Qué tal, compañero?</answer><citations>—</citations>");
        assert_eq!(r.answer, "¿Qué tal, compañero?");
        assert_eq!(r.citations, "—");
    }

    #[test]
    fn full_reply_round_trips() {
        let original = DecodedResponse {
            question_analysis: "the user asks about the 1970 campaign".into(),
            answer: "we won by a narrow margin.".into(),
            suggested_documents: "speech at the national stadium".into(),
            citations: String::new(),
        };
        assert_eq!(decode(&original.encode()), original);
    }
}
