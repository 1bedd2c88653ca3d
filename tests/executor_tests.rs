use std::sync::Arc;

use cyclone::config::TimingConfig;
use cyclone::logsink::{LogScope, LogType, MemoryLogSink};
use cyclone::mailbox::SlotStatus;
use cyclone::worker::JobExecutor;

/// Create a test executor that logs into an in-memory sink
fn test_executor() -> (JobExecutor, Arc<MemoryLogSink>) {
    let sink = Arc::new(MemoryLogSink::new());
    let timing = TimingConfig {
        log_flush_lines: 100,
        log_flush_interval_ms: 50,
        ..TimingConfig::default()
    };
    (JobExecutor::new(sink.clone(), &timing), sink)
}

fn scope() -> LogScope {
    LogScope::new("job-1", "render", "research")
}

/// All STDOUT lines shipped for the job, in order.
fn shipped_lines(sink: &MemoryLogSink) -> Vec<String> {
    sink.of_type(LogType::Stdout)
        .into_iter()
        .flat_map(|record| {
            record.data["lines"]
                .as_array()
                .cloned()
                .unwrap_or_default()
                .into_iter()
                .filter_map(|line| line.as_str().map(str::to_string))
        })
        .collect()
}

#[tokio::test]
async fn test_execute_simple_command() {
    let (executor, sink) = test_executor();

    let result = executor.execute(&scope(), "echo hello").await;

    assert_eq!(result.status, SlotStatus::Successful);
    assert_eq!(result.exit_code, Some(0));
    assert_eq!(result.output, "hello\n");
    assert_eq!(shipped_lines(&sink), ["hello"]);
}

#[tokio::test]
async fn test_execute_empty_output() {
    let (executor, sink) = test_executor();

    let result = executor.execute(&scope(), "true").await;

    assert_eq!(result.status, SlotStatus::Successful);
    assert!(result.output.is_empty());
    assert!(sink.of_type(LogType::Stdout).is_empty());
}

#[tokio::test]
async fn test_execute_large_output_keeps_tail() {
    let (executor, sink) = test_executor();

    let result = executor.execute(&scope(), "seq 1 500").await;

    assert_eq!(result.status, SlotStatus::Successful);
    let lines: Vec<&str> = result.output.lines().collect();
    assert_eq!(lines.len(), 50);
    assert_eq!(lines.first(), Some(&"451"));
    assert_eq!(lines.last(), Some(&"500"));

    // Every line still reaches the log sink, in chunks of at most 100
    let shipped = shipped_lines(&sink);
    assert_eq!(shipped.len(), 500);
    assert_eq!(shipped[0], "1");
    assert!(sink
        .of_type(LogType::Stdout)
        .iter()
        .all(|r| r.data["lines"].as_array().map_or(0, Vec::len) <= 100));
}

#[tokio::test]
async fn test_execute_command_failure() {
    let (executor, _sink) = test_executor();

    let result = executor.execute(&scope(), "exit 3").await;

    assert_eq!(result.status, SlotStatus::Failed);
    assert_eq!(result.exit_code, Some(3));
    assert_eq!(result.output, "FAILED\n");
}

#[tokio::test]
async fn test_execute_command_with_stderr() {
    let (executor, _sink) = test_executor();

    let result = executor
        .execute(&scope(), "echo partial; echo 'error message' >&2; exit 1")
        .await;

    assert_eq!(result.status, SlotStatus::Failed);
    assert_eq!(result.output, "partial\nFAILED\nerror message\n");
}

#[tokio::test]
async fn test_execute_output_with_invalid_utf8() {
    let (executor, sink) = test_executor();

    let result = executor
        .execute(&scope(), "printf 'ok\\n\\377bad\\n'; seq 1 2000; echo done")
        .await;

    // Reading carries on past the bad line, so the job is not cut short
    assert_eq!(result.status, SlotStatus::Successful);
    assert!(result.output.ends_with("2000\ndone\n"));
    let shipped = shipped_lines(&sink);
    assert_eq!(shipped.len(), 2003);
    assert_eq!(shipped[1], "\u{FFFD}bad");
}

#[tokio::test]
async fn test_execute_stderr_with_invalid_utf8() {
    let (executor, _sink) = test_executor();

    let result = executor
        .execute(&scope(), "printf '\\377oops\\n' >&2; exit 1")
        .await;

    assert_eq!(result.status, SlotStatus::Failed);
    assert_eq!(result.output, "FAILED\n\u{FFFD}oops\n");
}

#[tokio::test]
async fn test_execute_invalid_command() {
    let (executor, _sink) = test_executor();

    let result = executor.execute(&scope(), "nonexistent_command_12345").await;

    assert_eq!(result.status, SlotStatus::Failed);
    assert!(result.output.starts_with("FAILED\n"));
    assert!(result.output.contains("nonexistent_command_12345"));
}

#[tokio::test]
async fn test_execute_multiline_output() {
    let (executor, _sink) = test_executor();

    let result = executor
        .execute(&scope(), "printf 'line1\\nline2\\nline3\\n'")
        .await;

    assert_eq!(result.status, SlotStatus::Successful);
    assert_eq!(result.output.lines().count(), 3);
}

#[tokio::test]
async fn test_execute_with_special_characters() {
    let (executor, _sink) = test_executor();

    let result = executor.execute(&scope(), "echo 'hello $USER'").await;

    assert_eq!(result.status, SlotStatus::Successful);
    // Single quotes prevent variable expansion
    assert_eq!(result.output, "hello $USER\n");
}

#[tokio::test]
async fn test_execute_piped_commands() {
    let (executor, _sink) = test_executor();

    let result = executor.execute(&scope(), "echo 'hello world' | wc -w").await;

    assert_eq!(result.status, SlotStatus::Successful);
    assert_eq!(result.output.trim(), "2");
}

#[tokio::test]
async fn test_shipped_records_carry_job_scope() {
    let (executor, sink) = test_executor();

    executor.execute(&scope(), "echo scoped").await;

    let records = sink.of_type(LogType::Stdout);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].id, "job-1");
    assert_eq!(records[0].job_definition, "render");
    assert_eq!(records[0].job_queue, "research");
}
