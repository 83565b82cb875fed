//! In-process stand-in for the community daemon's management interface

use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;

use crate::model::{BackendKind, LiveSession};

#[derive(Default)]
struct DaemonState {
    clients: Vec<LiveSession>,
    commands: Vec<String>,
    kill_reply: Option<String>,
}

type SharedState = Arc<Mutex<DaemonState>>;

/// Listens on `127.0.0.1:<ephemeral>` and answers `status` and `kill` the way
/// OpenVPN does, keeping a mutable client list.
pub struct FakeManagementServer {
    port: u16,
    state: SharedState,
    task: JoinHandle<()>,
}

impl FakeManagementServer {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake management interface");
        let port = listener.local_addr().expect("local addr").port();
        let state = SharedState::default();

        let accept_state = state.clone();
        let task = tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let state = accept_state.clone();
                tokio::spawn(async move {
                    let _ = serve(socket, state).await;
                });
            }
        });

        Self { port, state, task }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn connect_client(&self, username: &str, real_address: &str, virtual_address: &str) {
        self.state.lock().unwrap().clients.push(LiveSession {
            username: username.to_string(),
            real_address: Some(real_address.to_string()),
            virtual_address: Some(virtual_address.to_string()),
            backend: BackendKind::Community,
        });
    }

    pub fn sessions_of(&self, username: &str) -> Vec<LiveSession> {
        self.state
            .lock()
            .unwrap()
            .clients
            .iter()
            .filter(|s| s.username == username)
            .cloned()
            .collect()
    }

    /// Answer the next `kill` with `reply` instead of acting on it
    pub fn reject_next(&self, reply: &str) {
        self.state.lock().unwrap().kill_reply = Some(reply.to_string());
    }

    /// Every command received so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.state.lock().unwrap().commands.clone()
    }
}

impl Drop for FakeManagementServer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

async fn serve(socket: TcpStream, state: SharedState) -> std::io::Result<()> {
    let (reader, mut writer) = socket.into_split();
    writer
        .write_all(b">INFO:OpenVPN Management Interface Version 5 -- type 'help' for more info\n")
        .await?;

    let mut lines = BufReader::new(reader).lines();
    while let Some(line) = lines.next_line().await? {
        let reply = respond(&state, line.trim());
        writer.write_all(reply.as_bytes()).await?;
    }
    Ok(())
}

fn respond(state: &SharedState, command: &str) -> String {
    let mut state = state.lock().unwrap();
    state.commands.push(command.to_string());

    if command == "status" || command.starts_with("status ") {
        // Real-time notifications may interleave with command output
        let mut out = String::from(">BYTECOUNT:0,0\nTITLE,OpenVPN 2.6 fake\n");
        out.push_str("HEADER,CLIENT_LIST,Common Name,Real Address,Virtual Address\n");
        for client in &state.clients {
            out.push_str(&format!(
                "CLIENT_LIST,{},{},{},,0,0\n",
                client.username,
                client.real_address.as_deref().unwrap_or(""),
                client.virtual_address.as_deref().unwrap_or(""),
            ));
        }
        out.push_str("END\n");
        out
    } else if let Some(reply) = command.strip_prefix("kill ").and_then(|_| state.kill_reply.take()) {
        format!("{}\n", reply)
    } else if let Some(name) = command.strip_prefix("kill ") {
        let before = state.clients.len();
        state.clients.retain(|c| c.username != name);
        let killed = before - state.clients.len();
        if killed > 0 {
            format!("SUCCESS: common name '{}' found, {} client(s) killed\n", name, killed)
        } else {
            format!("ERROR: common name '{}' not found\n", name)
        }
    } else {
        "ERROR: unknown command, enter 'help' for more options\n".to_string()
    }
}
