use runbridge::app::serve::{serve, ServeSummary, CONSOLE_CONVERSATION};
use runbridge::config::Settings;
use runbridge::queue::ExecutionDispatch;
use runbridge::runtime::{CollectingSink, ExecutionReport};
use runbridge::shared::CancellationToken;
use std::io::Cursor;
use std::sync::Arc;

#[test]
fn serve_answers_every_valid_line_and_counts_rejections() {
    let mut settings = Settings::default();
    settings.workers.count = 1;
    settings.workers.min_poll_ms = 5;
    settings.workers.max_poll_ms = 10;

    let input = Cursor::new(
        [
            "run nightly-backup",
            "",
            "status run-unknown-0000",
            r#"{"from":"bob","conversation":"ops","body":"hello there"}"#,
            r#"{"from":"","conversation":"ops","body":"run x"}"#,
            "{broken",
        ]
        .join("\n"),
    );
    let sink = Arc::new(CollectingSink::new());
    let executor = Arc::new(|_: &ExecutionDispatch, _: &CancellationToken| {
        ExecutionReport::succeeded("noop")
    });

    let summary = serve(&settings, input, executor, sink.clone()).expect("serve");
    assert_eq!(
        summary,
        ServeSummary {
            received: 5,
            rejected: 2
        }
    );

    let messages = sink.messages();
    assert_eq!(messages.len(), 3);
    assert!(messages[0].body.contains("nightly-backup"));
    assert_eq!(messages[0].conversation, CONSOLE_CONVERSATION);
    assert!(messages[1].body.contains("run-unknown-0000"));
    assert_eq!(messages[2].conversation, "ops");
}
