use clap::Parser;

/// Run the chat relay server on the configured address.
///
/// The listen address comes from `CHAT_RELAY_ADDR` (default `127.0.0.1:8000`).
#[derive(Parser, Debug)]
#[command(name = "chat-server", author, version, about, long_about = None)]
pub struct ServerCli {}

/// Connect to the chat relay and chat from the terminal. Enter `q` to quit.
#[derive(Parser, Debug)]
#[command(name = "chat-client", author, version, about, long_about = None)]
pub struct ClientCli {
    /// Userid to log in with.
    pub userid: String,
}
