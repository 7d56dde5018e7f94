//! `modeldock watch [CHANNEL...]` – print envelopes as JSON lines until the daemon goes away.

use anyhow::Result;
use modeldock_core::control::Request;
use modeldock_core::events::Channel;

use crate::cli::control_socket::ControlClient;

pub async fn run_watch(client: &mut ControlClient, channels: Vec<Channel>) -> Result<()> {
    let request = if channels.is_empty() {
        Request::SubscribeAll
    } else {
        Request::Subscribe { channels }
    };
    let subscribed: Vec<Channel> = client.call_as(&request).await?;
    tracing::debug!(?subscribed, "watching");
    while let Some(envelope) = client.next_event().await? {
        println!("{}", serde_json::to_string(&envelope)?);
    }
    Ok(())
}
