//! Line-oriented terminal front end.
//!
//! Plain lines are sent as chat messages; lines starting with `/` are commands.
//! Assistant output is printed as it streams in.

use futures::StreamExt;
use herald::{
    ChatStreamController, ConnectionMonitor, ConversationStore, ConversationUpdate, JobEventRouter, JobStore,
    JobUpdate, MessageRole, ProcessingJob, TurnOutcome,
};
use std::collections::HashMap;
use std::io::Write;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::broadcast::error::RecvError;
use tokio::task::JoinHandle;

const HELP: &str = "\
Commands:
  /stop        stop the answer being streamed
  /new         start a new conversation
  /jobs        list tracked jobs
  /status      show network and stream status
  /reconnect   restart the job stream
  /help        show this help
  /quit        exit";

#[derive(Debug, Clone, PartialEq, Eq)]
enum Command {
    Send(String),
    Stop,
    New,
    Jobs,
    Status,
    Reconnect,
    Help,
    Quit,
    Unknown(String),
}

fn parse_command(line: &str) -> Option<Command> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    let Some(command) = line.strip_prefix('/') else {
        return Some(Command::Send(line.to_string()));
    };
    let command = match command.split_whitespace().next().unwrap_or_default() {
        "stop" => Command::Stop,
        "new" => Command::New,
        "jobs" => Command::Jobs,
        "status" => Command::Status,
        "reconnect" => Command::Reconnect,
        "help" | "?" => Command::Help,
        "quit" | "exit" | "q" => Command::Quit,
        other => Command::Unknown(other.to_string()),
    };
    Some(command)
}

pub struct Session {
    chat: ChatStreamController,
    jobs: JobStore,
    router: Option<JobEventRouter>,
    monitor: Option<ConnectionMonitor>,
    conversation_id: String,
    background: Vec<JoinHandle<()>>,
}

impl Session {
    pub fn new(
        chat: ChatStreamController,
        jobs: JobStore,
        router: Option<JobEventRouter>,
        monitor: Option<ConnectionMonitor>,
        conversation_id: String,
    ) -> Self {
        Self {
            chat,
            jobs,
            router,
            monitor,
            conversation_id,
            background: Vec::new(),
        }
    }

    pub async fn run(mut self) -> anyhow::Result<()> {
        self.spawn_renderers();
        println!("Connected. Type a message, or /help for commands.");

        let mut lines = BufReader::new(tokio::io::stdin()).lines();
        loop {
            let line = tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    println!();
                    break;
                }
                line = lines.next_line() => line?,
            };
            let Some(line) = line else {
                break;
            };
            let Some(command) = parse_command(&line) else {
                continue;
            };

            match command {
                Command::Send(text) => self.send(text),
                Command::Stop => {
                    if self.chat.is_streaming(&self.conversation_id) {
                        self.chat.stop_streaming(&self.conversation_id);
                    } else {
                        println!("Nothing is streaming.");
                    }
                }
                Command::New => {
                    self.chat.stop_streaming(&self.conversation_id);
                    self.conversation_id = self.chat.store().create();
                    println!("Started conversation {}", self.conversation_id);
                }
                Command::Jobs => self.print_jobs(),
                Command::Status => self.print_status(),
                Command::Reconnect => match &self.router {
                    Some(router) => {
                        router.reconnect();
                        println!("Job stream restarting.");
                    }
                    None => println!("Job stream is disabled."),
                },
                Command::Help => println!("{}", HELP),
                Command::Quit => break,
                Command::Unknown(name) => println!("Unknown command /{}. Try /help.", name),
            }
        }

        self.shutdown();
        Ok(())
    }

    fn send(&self, text: String) {
        if self.chat.is_streaming(&self.conversation_id) {
            println!("Still answering. Wait for it or /stop first.");
            return;
        }

        let chat = self.chat.clone();
        let conversation_id = self.conversation_id.clone();
        tokio::spawn(async move {
            match chat.send_message(&conversation_id, &text).await {
                Ok(TurnOutcome::Completed(_)) => println!(),
                Ok(TurnOutcome::Stopped(_)) => println!("\n[stopped]"),
                Err(err) => {
                    println!("\n[error] {}", err.user_message());
                    if err.is_retryable() {
                        println!("Send the message again to retry.");
                    }
                }
            }
        });
    }

    fn spawn_renderers(&mut self) {
        self.background.push(tokio::spawn(render_messages(self.chat.store().clone())));
        self.background.push(tokio::spawn(render_jobs(self.jobs.clone())));

        if let Some(mut phases) = self.router.as_ref().and_then(JobEventRouter::subscribe_phase) {
            self.background.push(tokio::spawn(async move {
                while phases.changed().await.is_ok() {
                    if phases.borrow_and_update().is_terminal() {
                        println!("[jobs] stream gave up, /reconnect to try again");
                    }
                }
            }));
        }

        if let Some(monitor) = &self.monitor {
            // the first item is the status at startup
            let mut statuses = monitor.stream().skip(1);
            self.background.push(tokio::spawn(async move {
                while let Some(status) = statuses.next().await {
                    println!("[network] {}", status);
                }
            }));
        }
    }

    fn print_jobs(&self) {
        let jobs = self.jobs.list();
        if jobs.is_empty() {
            println!("No jobs.");
            return;
        }
        for job in &jobs {
            println!("{}", describe_job(job));
        }
    }

    fn print_status(&self) {
        match &self.monitor {
            Some(monitor) => println!("network:  {}", monitor.status()),
            None => println!("network:  not monitored"),
        }
        println!("chat:     {}", self.chat.connection_state(&self.conversation_id));
        match &self.router {
            Some(router) => println!("jobs:     {}", router.connection_state()),
            None => println!("jobs:     disabled"),
        }
        let diagnostics = self.chat.diagnostics().total();
        if diagnostics > 0 {
            println!("dropped:  {} malformed stream lines", diagnostics);
        }
    }

    fn shutdown(&mut self) {
        self.chat.shutdown();
        if let Some(router) = &self.router {
            router.stop();
        }
        if let Some(monitor) = &self.monitor {
            monitor.stop();
        }
        for task in self.background.drain(..) {
            task.abort();
        }
    }
}

fn describe_job(job: &ProcessingJob) -> String {
    let mut line = format!("[job {}] {:?} {:.0}%", job.job_id, job.status, job.progress);
    if !job.current_step.is_empty() {
        line.push_str(&format!(" {}", job.current_step));
    }
    if let Some(error) = &job.error_message {
        line.push_str(&format!(" ({})", error));
    }
    line
}

/// Print assistant text as it grows
async fn render_messages(store: ConversationStore) {
    let mut updates = store.subscribe();
    let mut printed: HashMap<String, String> = HashMap::new();

    loop {
        let (conversation_id, message_id) = match updates.recv().await {
            Ok(ConversationUpdate::MessageAdded { conversation_id, message_id })
            | Ok(ConversationUpdate::MessageUpdated { conversation_id, message_id }) => (conversation_id, message_id),
            Ok(ConversationUpdate::MessageRemoved { message_id, .. }) => {
                printed.remove(&message_id);
                continue;
            }
            Ok(_) => continue,
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        };

        let Some(message) = store.message(&conversation_id, &message_id) else {
            continue;
        };
        if message.role != MessageRole::Assistant {
            continue;
        }

        let shown = printed.entry(message_id.clone()).or_insert_with(|| {
            print!("assistant> ");
            String::new()
        });
        match message.content.strip_prefix(shown.as_str()) {
            Some(delta) => print!("{}", delta),
            // restarted or replaced by the final text
            None => print!("\n{}", message.content),
        }
        *shown = message.content.clone();
        let _ = std::io::stdout().flush();

        if !message.is_streaming {
            printed.remove(&message_id);
        }
    }
}

async fn render_jobs(jobs: JobStore) {
    let mut updates = jobs.subscribe();
    loop {
        match updates.recv().await {
            Ok(JobUpdate::Upserted(job)) => println!("{}", describe_job(&job)),
            Ok(JobUpdate::Removed { job_id }) => println!("[job {}] removed", job_id),
            Err(RecvError::Lagged(_)) => continue,
            Err(RecvError::Closed) => return,
        }
    }
}
