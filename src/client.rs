//! CLI client for the control plane.
//!
//! Every subcommand except `serve` is a thin HTTP client: it calls the
//! supervisor's API, prints the result, and exits with a code describing the
//! failure class. Log tailing polls the incremental endpoint once per second
//! and keeps per-stream cursors so lines are printed exactly once.

use std::collections::HashMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use serde::Deserialize;
use thiserror::Error;

use crate::config::ProcessDefinition;
use crate::output::LogSlice;
use crate::serve::StateView;

const USER_AGENT: &str = concat!("procman/", env!("CARGO_PKG_VERSION"));

/// Client-side failure classes, each with its own process exit code.
#[derive(Debug, Error)]
pub enum ClientError {
    /// The control plane could not be reached.
    #[error("failed to connect to the control plane: {0}")]
    Connect(reqwest::Error),

    /// The control plane answered with something we cannot interpret.
    #[error("unexpected status code: {0}")]
    UnexpectedStatus(StatusCode),

    /// A local precondition failed before any request was made.
    #[error("{0}")]
    Local(String),

    /// The control plane reported a failure for the request.
    #[error("request failed ({status}): {message}")]
    Api { status: StatusCode, message: String },
}

impl ClientError {
    pub fn exit_code(&self) -> i32 {
        match self {
            ClientError::Connect(_) => 1,
            ClientError::UnexpectedStatus(_) => 2,
            ClientError::Local(_) => 3,
            ClientError::Api { .. } => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ListFormat {
    Table,
    Csv,
}

#[derive(Debug, Deserialize)]
struct MessageBody {
    message: String,
}

#[derive(Debug, Deserialize)]
struct StopBody {
    graceful: bool,
}

pub struct ControlClient {
    base: String,
    http: reqwest::Client,
}

impl ControlClient {
    /// Creates a client for the control plane at `addr` (`host:port`).
    pub fn new(addr: &str) -> Result<Self, ClientError> {
        let http = reqwest::Client::builder()
            .user_agent(USER_AGENT)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|err| ClientError::Local(format!("failed to build HTTP client: {}", err)))?;
        Ok(Self {
            base: format!("http://{}", addr),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base, path)
    }

    /// `list`: fetch the full state and render the definition table.
    pub async fn list(&self, format: ListFormat) -> Result<(), ClientError> {
        let state = self.fetch_state().await?;
        let rows: Vec<[String; 4]> = state
            .config
            .servers
            .iter()
            .map(|def| {
                [
                    def.name.clone(),
                    state.runners.contains_key(&def.name).to_string(),
                    def.directory.display().to_string(),
                    def.command.clone(),
                ]
            })
            .collect();
        match format {
            ListFormat::Table => print!("{}", render_table(&rows)),
            ListFormat::Csv => print!("{}", render_csv(&rows)),
        }
        Ok(())
    }

    /// `add`: build a definition from the caller's working directory and
    /// post it to the config API.
    pub async fn add(&self, name: Option<String>, words: &[String]) -> Result<(), ClientError> {
        let directory = env::current_dir().map_err(|err| {
            ClientError::Local(format!("failed to get current working directory: {}", err))
        })?;
        let def = definition_for_add(
            name,
            directory,
            env::var_os("DIRENV_FILE").is_some(),
            env::var("PATH").ok(),
            words,
        )?;
        let response = self
            .http
            .post(self.url("/api/config/server"))
            .json(&def)
            .send()
            .await
            .map_err(ClientError::Connect)?;
        expect_mutation(response, StatusCode::CREATED).await?;
        println!("Created");
        Ok(())
    }

    /// `remove`: delete a definition.
    pub async fn remove(&self, name: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/config/server/{}", name)))
            .send()
            .await
            .map_err(ClientError::Connect)?;
        expect_mutation(response, StatusCode::OK).await?;
        println!("OK");
        Ok(())
    }

    /// `start`: spawn the runner for a definition.
    pub async fn start(&self, name: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .post(self.url(&format!("/api/runner/{}", name)))
            .send()
            .await
            .map_err(ClientError::Connect)?;
        expect_mutation(response, StatusCode::CREATED).await?;
        println!("Started");
        Ok(())
    }

    /// `stop`: terminate the runner, reporting a forced kill.
    pub async fn stop(&self, name: &str) -> Result<(), ClientError> {
        let response = self
            .http
            .delete(self.url(&format!("/api/runner/{}", name)))
            .send()
            .await
            .map_err(ClientError::Connect)?;
        let response = expect_mutation(response, StatusCode::OK).await?;
        match response.json::<StopBody>().await {
            Ok(body) if !body.graceful => println!("OK (killed after grace period)"),
            _ => println!("OK"),
        }
        Ok(())
    }

    /// `logs`: tail both output streams, polling once per second.
    ///
    /// Runs until interrupted, or until the runner's buffers are gone.
    pub async fn logs(&self, name: &str) -> Result<(), ClientError> {
        let mut stdout_cursor: i64 = -1;
        let mut stderr_cursor: i64 = -1;
        let mut warned_truncated = false;
        loop {
            let since = stdout_cursor.min(stderr_cursor);
            let slice = self.fetch_logs(name, since).await?;

            let (fresh, cursor) =
                fresh_lines(&slice.stdout, slice.stdout_min, since, stdout_cursor);
            for line in fresh {
                println!("stdout> {}", line);
            }
            stdout_cursor = cursor;

            let (fresh, cursor) =
                fresh_lines(&slice.stderr, slice.stderr_min, since, stderr_cursor);
            for line in fresh {
                println!("stderr> {}", line);
            }
            stderr_cursor = cursor;

            if slice.truncated && !warned_truncated {
                eprintln!("warning: some output was evicted before it could be fetched");
                warned_truncated = true;
            }

            tokio::time::sleep(Duration::from_secs(1)).await;
        }
    }

    async fn fetch_state(&self) -> Result<StateView, ClientError> {
        let response = self
            .http
            .get(self.url("/api/state"))
            .send()
            .await
            .map_err(ClientError::Connect)?;
        let status = response.status();
        if status != StatusCode::OK {
            return Err(ClientError::UnexpectedStatus(status));
        }
        response
            .json::<StateView>()
            .await
            .map_err(|_| ClientError::UnexpectedStatus(status))
    }

    async fn fetch_logs(&self, name: &str, since: i64) -> Result<LogSlice, ClientError> {
        let response = self
            .http
            .get(self.url(&format!("/api/runner/{}/logs", name)))
            .query(&[("since", since)])
            .send()
            .await
            .map_err(ClientError::Connect)?;
        let status = response.status();
        if status == StatusCode::NOT_FOUND {
            return Err(ClientError::Local(format!(
                "process '{}' doesn't seem to be running",
                name
            )));
        }
        if status != StatusCode::OK {
            return Err(ClientError::UnexpectedStatus(status));
        }
        response
            .json::<LogSlice>()
            .await
            .map_err(|_| ClientError::UnexpectedStatus(status))
    }
}

/// Maps a non-expected mutation response to an API failure, preferring the
/// server's `{"message"}` body over the bare status code.
async fn expect_mutation(
    response: reqwest::Response,
    expected: StatusCode,
) -> Result<reqwest::Response, ClientError> {
    let status = response.status();
    if status == expected {
        return Ok(response);
    }
    match response.json::<MessageBody>().await {
        Ok(body) => Err(ClientError::Api {
            status,
            message: body.message,
        }),
        Err(_) => Err(ClientError::UnexpectedStatus(status)),
    }
}

/// Builds the definition `add` posts: name defaults to the directory
/// basename, the environment is seeded with the caller's PATH so the
/// supervisor spawns with the same lookup the caller had.
fn definition_for_add(
    name: Option<String>,
    directory: PathBuf,
    use_direnv: bool,
    path_var: Option<String>,
    words: &[String],
) -> Result<ProcessDefinition, ClientError> {
    if words.is_empty() {
        return Err(ClientError::Local("no command given".into()));
    }
    let name = match name {
        Some(name) => name,
        None => directory
            .file_name()
            .map(|base| base.to_string_lossy().to_string())
            .ok_or_else(|| {
                ClientError::Local("cannot derive a name from the working directory".into())
            })?,
    };
    let mut environment = HashMap::new();
    if let Some(path) = path_var {
        environment.insert("PATH".to_string(), path);
    }
    Ok(ProcessDefinition {
        name,
        directory,
        command: shell_words::join(words),
        use_direnv,
        environment,
    })
}

/// Returns the lines of one stream the caller has not seen yet, plus the new
/// cursor. The server returns consecutive lines starting at
/// `max(since + 1, min_index)`.
fn fresh_lines(lines: &[String], min_index: i64, since: i64, cursor: i64) -> (Vec<String>, i64) {
    let start = min_index.max(since + 1);
    let fresh: Vec<String> = lines
        .iter()
        .enumerate()
        .filter(|(offset, _)| start + *offset as i64 > cursor)
        .map(|(_, line)| line.clone())
        .collect();
    let new_cursor = if lines.is_empty() {
        cursor
    } else {
        cursor.max(start + lines.len() as i64 - 1)
    };
    (fresh, new_cursor)
}

const LIST_HEADER: [&str; 4] = ["Name", "Running", "Directory", "Command"];

fn render_table(rows: &[[String; 4]]) -> String {
    let mut widths = LIST_HEADER.map(str::len);
    for row in rows {
        for (column, cell) in row.iter().enumerate() {
            widths[column] = widths[column].max(cell.len());
        }
    }
    let mut out = String::new();
    let mut push_row = |cells: [&str; 4], out: &mut String| {
        for (column, cell) in cells.iter().enumerate() {
            if column > 0 {
                out.push_str("  ");
            }
            out.push_str(cell);
            if column < 3 {
                for _ in cell.len()..widths[column] {
                    out.push(' ');
                }
            }
        }
        out.push('\n');
    };
    push_row(LIST_HEADER, &mut out);
    for row in rows {
        push_row([&row[0], &row[1], &row[2], &row[3]], &mut out);
    }
    out
}

fn render_csv(rows: &[[String; 4]]) -> String {
    let mut out = String::new();
    let mut push_row = |cells: [&str; 4], out: &mut String| {
        let encoded: Vec<String> = cells.iter().map(|cell| csv_field(cell)).collect();
        out.push_str(&encoded.join(","));
        out.push('\n');
    };
    push_row(LIST_HEADER, &mut out);
    for row in rows {
        push_row([&row[0], &row[1], &row[2], &row[3]], &mut out);
    }
    out
}

fn csv_field(value: &str) -> String {
    if value.contains([',', '"', '\n']) {
        format!("\"{}\"", value.replace('"', "\"\""))
    } else {
        value.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_definition_defaults_name_to_directory_basename() {
        let def = definition_for_add(
            None,
            PathBuf::from("/home/user/projects/webapp"),
            true,
            Some("/usr/bin".to_string()),
            &["npm".to_string(), "run".to_string(), "dev".to_string()],
        )
        .unwrap();
        assert_eq!(def.name, "webapp");
        assert_eq!(def.command, "npm run dev");
        assert!(def.use_direnv);
        assert_eq!(def.environment["PATH"], "/usr/bin");
    }

    #[test]
    fn add_definition_quotes_command_words() {
        let def = definition_for_add(
            Some("svc".to_string()),
            PathBuf::from("/srv/svc"),
            false,
            None,
            &["echo".to_string(), "hello world".to_string()],
        )
        .unwrap();
        assert_eq!(def.command, "echo 'hello world'");
    }

    #[test]
    fn add_definition_requires_a_command() {
        let err = definition_for_add(None, PathBuf::from("/srv/svc"), false, None, &[]);
        assert!(matches!(err, Err(ClientError::Local(_))));
    }

    #[test]
    fn fresh_lines_skips_already_seen_indices() {
        // Server answered since=-1 with lines 0..=3; stdout cursor is at 1.
        let lines: Vec<String> = ["a", "b", "c", "d"].map(String::from).to_vec();
        let (fresh, cursor) = fresh_lines(&lines, 0, -1, 1);
        assert_eq!(fresh, vec!["c", "d"]);
        assert_eq!(cursor, 3);
    }

    #[test]
    fn fresh_lines_handles_eviction_window() {
        // Buffer retained lines 5..=7 only; cursor was at 2.
        let lines: Vec<String> = ["f", "g", "h"].map(String::from).to_vec();
        let (fresh, cursor) = fresh_lines(&lines, 5, 2, 2);
        assert_eq!(fresh, vec!["f", "g", "h"]);
        assert_eq!(cursor, 7);
    }

    #[test]
    fn fresh_lines_keeps_cursor_on_empty_response() {
        let (fresh, cursor) = fresh_lines(&[], 0, 4, 4);
        assert!(fresh.is_empty());
        assert_eq!(cursor, 4);
    }

    #[test]
    fn table_columns_are_aligned() {
        let rows = vec![
            [
                "web".to_string(),
                "true".to_string(),
                "/srv/web".to_string(),
                "npm run dev".to_string(),
            ],
            [
                "worker".to_string(),
                "false".to_string(),
                "/srv/worker".to_string(),
                "cargo run".to_string(),
            ],
        ];
        let table = render_table(&rows);
        let lines: Vec<&str> = table.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[0].starts_with("Name    Running"));
        assert!(lines[1].contains("web     true "));
        assert!(lines[2].contains("worker  false"));
    }

    #[test]
    fn csv_escapes_embedded_commas_and_quotes() {
        let rows = vec![[
            "svc".to_string(),
            "false".to_string(),
            "/srv/svc".to_string(),
            "echo \"a,b\"".to_string(),
        ]];
        let csv = render_csv(&rows);
        let lines: Vec<&str> = csv.lines().collect();
        assert_eq!(lines[0], "Name,Running,Directory,Command");
        assert_eq!(lines[1], "svc,false,/srv/svc,\"echo \"\"a,b\"\"\"");
    }

    #[test]
    fn exit_codes_follow_failure_class() {
        assert_eq!(
            ClientError::UnexpectedStatus(StatusCode::IM_A_TEAPOT).exit_code(),
            2
        );
        assert_eq!(ClientError::Local("x".into()).exit_code(), 3);
        assert_eq!(
            ClientError::Api {
                status: StatusCode::BAD_REQUEST,
                message: "x".into()
            }
            .exit_code(),
            4
        );
    }
}
