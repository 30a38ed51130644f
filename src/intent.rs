use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum IntentType {
    Unknown,
    RunJob,
    ApproveRun,
    DenyRun,
    Status,
}

impl IntentType {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown",
            Self::RunJob => "RunJob",
            Self::ApproveRun => "ApproveRun",
            Self::DenyRun => "DenyRun",
            Self::Status => "Status",
        }
    }

    fn from_command(command: &str) -> Option<Self> {
        match command.to_ascii_lowercase().as_str() {
            "run" => Some(Self::RunJob),
            "yes" | "approve" => Some(Self::ApproveRun),
            "no" | "deny" => Some(Self::DenyRun),
            "status" => Some(Self::Status),
            _ => None,
        }
    }
}

impl std::fmt::Display for IntentType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalized command extracted from one chat message.
///
/// `job_key` is only set for [`IntentType::RunJob`]; `run_id` only for
/// approve, deny and status. [`IntentType::Unknown`] carries neither.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParsedIntent {
    #[serde(rename = "type")]
    pub intent_type: IntentType,
    pub raw_text: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<String>,
}

impl ParsedIntent {
    fn unknown(raw_text: &str) -> Self {
        Self {
            intent_type: IntentType::Unknown,
            raw_text: raw_text.to_string(),
            job_key: None,
            run_id: None,
        }
    }
}

/// Deterministic command parser. Never fails; unmatched input is `Unknown`.
pub fn parse(text: &str) -> ParsedIntent {
    let raw_text = text.trim();
    let mut tokens = raw_text.split_whitespace();
    let (Some(command), Some(argument), None) = (tokens.next(), tokens.next(), tokens.next())
    else {
        return ParsedIntent::unknown(raw_text);
    };
    let Some(intent_type) = IntentType::from_command(command) else {
        return ParsedIntent::unknown(raw_text);
    };

    let argument = Some(argument.to_string());
    let (job_key, run_id) = match intent_type {
        IntentType::RunJob => (argument, None),
        _ => (None, argument),
    };
    ParsedIntent {
        intent_type,
        raw_text: raw_text.to_string(),
        job_key,
        run_id,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_command_word_maps_to_its_intent() {
        let cases = [
            ("run backup", IntentType::RunJob),
            ("yes r1", IntentType::ApproveRun),
            ("approve r1", IntentType::ApproveRun),
            ("no r1", IntentType::DenyRun),
            ("deny r1", IntentType::DenyRun),
            ("status r1", IntentType::Status),
        ];
        for (input, expected) in cases {
            assert_eq!(parse(input).intent_type, expected, "input `{input}`");
        }
    }

    #[test]
    fn command_must_be_followed_by_whitespace() {
        assert_eq!(parse("yes\tABC").run_id.as_deref(), Some("ABC"));
        assert_eq!(parse("yes,ABC").intent_type, IntentType::Unknown);
        assert_eq!(parse("yes-ABC").intent_type, IntentType::Unknown);
    }

    #[test]
    fn raw_text_is_trimmed_but_argument_case_is_kept() {
        let intent = parse("  RUN Nightly-Backup \n");
        assert_eq!(intent.raw_text, "RUN Nightly-Backup");
        assert_eq!(intent.job_key.as_deref(), Some("Nightly-Backup"));
        assert_eq!(intent.run_id, None);
    }
}
