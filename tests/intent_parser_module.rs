use runbridge::intent::{parse, IntentType};

#[test]
fn intent_parser_recognizes_every_command_word() {
    let cases = [
        ("run nightly-backup", IntentType::RunJob),
        ("yes run-abc-0001", IntentType::ApproveRun),
        ("approve run-abc-0001", IntentType::ApproveRun),
        ("no run-abc-0001", IntentType::DenyRun),
        ("deny run-abc-0001", IntentType::DenyRun),
        ("status run-abc-0001", IntentType::Status),
    ];
    for (text, expected) in cases {
        assert_eq!(parse(text).intent_type, expected, "parsing `{text}`");
    }
}

#[test]
fn intent_parser_is_case_insensitive_on_the_command_only() {
    let parsed = parse("  RUN   Nightly-Backup\t");
    assert_eq!(parsed.intent_type, IntentType::RunJob);
    assert_eq!(parsed.job_key.as_deref(), Some("Nightly-Backup"));
    assert_eq!(parsed.run_id, None);
    assert_eq!(parsed.raw_text, "RUN   Nightly-Backup");

    let approve = parse("Yes run-AbC");
    assert_eq!(approve.run_id.as_deref(), Some("run-AbC"));
    assert_eq!(approve.job_key, None);
}

#[test]
fn intent_parser_requires_exactly_two_tokens() {
    for text in [
        "",
        "   ",
        "run",
        "status",
        "run a b",
        "yes run-1 please",
        "please run backup",
        "runbackup",
        "stop run-1",
    ] {
        let parsed = parse(text);
        assert_eq!(parsed.intent_type, IntentType::Unknown, "parsing `{text}`");
        assert_eq!(parsed.job_key, None);
        assert_eq!(parsed.run_id, None);
    }
}

#[test]
fn intent_parser_is_deterministic() {
    let first = parse("deny run-xyz-9");
    for _ in 0..10 {
        assert_eq!(parse("deny run-xyz-9"), first);
    }
}
