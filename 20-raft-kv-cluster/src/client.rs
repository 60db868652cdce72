use std::time::Duration;

use anyhow::{Context, Result};
use reqwest::{Client, RequestBuilder};
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::select;
use tracing::warn;

use crate::cli::ClientArgs;
use crate::command::Command;
use crate::protocol::{ConsoleCommand, HELP};

/// Lifecycle calls can wait on several consensus timeouts in a row.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Thin JSON client for the server's HTTP API.
pub struct ApiClient {
    http: Client,
    base: String,
}

/// Status code and decoded body of one API call.
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

impl ApiClient {
    pub fn new(base: &str) -> Result<Self> {
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build http client")?;
        Ok(Self {
            http,
            base: base.trim_end_matches('/').to_string(),
        })
    }

    pub async fn execute(&self, command: &ConsoleCommand) -> Result<Option<ApiResponse>> {
        let request = match command {
            ConsoleCommand::Get { key } => self
                .http
                .post(self.url("/command"))
                .json(&Command::get(key.as_str())),
            ConsoleCommand::Set { key, value } => self
                .http
                .post(self.url("/command"))
                .json(&Command::set(key.as_str(), value.as_str())),
            ConsoleCommand::Leader => self.http.get(self.url("/leader")),
            ConsoleCommand::Nodes => self.http.get(self.url("/nodes")),
            ConsoleCommand::Stop { node } => self
                .http
                .post(self.url("/stop"))
                .json(&json!({ "node_id": node })),
            ConsoleCommand::Start { node } => self
                .http
                .post(self.url("/start"))
                .json(&json!({ "node_id": node })),
            ConsoleCommand::Help | ConsoleCommand::Exit => return Ok(None),
        };
        send(request).await.map(Some)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

async fn send(request: RequestBuilder) -> Result<ApiResponse> {
    let response = request.send().await.context("request failed")?;
    let status = response.status().as_u16();
    let body = response
        .json::<Value>()
        .await
        .context("server returned a non-JSON body")?;
    Ok(ApiResponse { status, body })
}

pub async fn run(args: ClientArgs) -> Result<()> {
    let client = ApiClient::new(&args.server)?;
    write_stdout(&format!("*** talking to {}, type `help` for commands", args.server)).await?;

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut input = String::new();

    loop {
        prompt().await?;
        input.clear();
        select! {
            bytes_read = stdin.read_line(&mut input) => {
                if bytes_read? == 0 || !handle_line(&client, &input).await? {
                    break;
                }
            }
            ctrl_c = tokio::signal::ctrl_c() => {
                if let Err(error) = ctrl_c {
                    warn!(?error, "ctrl-c handler failed");
                }
                break;
            }
        }
    }
    write_stdout("*** bye").await?;
    Ok(())
}

/// Returns `false` when the user asked to leave.
async fn handle_line(client: &ApiClient, line: &str) -> Result<bool> {
    if line.trim().is_empty() {
        return Ok(true);
    }
    let command = match ConsoleCommand::parse(line) {
        Ok(command) => command,
        Err(err) => {
            write_stderr(&format!("!!! {err}")).await?;
            return Ok(true);
        }
    };

    match command {
        ConsoleCommand::Exit => return Ok(false),
        ConsoleCommand::Help => write_stdout(HELP).await?,
        command => match client.execute(&command).await {
            Ok(Some(response)) => render(response).await?,
            Ok(None) => {}
            Err(err) => write_stderr(&format!("!!! {err:#}")).await?,
        },
    }
    Ok(true)
}

async fn render(response: ApiResponse) -> io::Result<()> {
    if let Some(error) = response.body.get("error").and_then(Value::as_str) {
        return write_stderr(&format!("!!! [{}] {error}", response.status)).await;
    }
    let text = serde_json::to_string_pretty(&response.body).unwrap_or_else(|_| response.body.to_string());
    write_stdout(&text).await
}

async fn prompt() -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(b"> ").await?;
    stdout.flush().await
}

async fn write_stdout(line: &str) -> io::Result<()> {
    let mut stdout = tokio::io::stdout();
    stdout.write_all(line.as_bytes()).await?;
    stdout.write_all(b"\n").await?;
    stdout.flush().await
}

async fn write_stderr(line: &str) -> io::Result<()> {
    let mut stderr = tokio::io::stderr();
    stderr.write_all(line.as_bytes()).await?;
    stderr.write_all(b"\n").await?;
    stderr.flush().await
}
