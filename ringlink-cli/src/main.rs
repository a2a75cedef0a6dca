//! Ringlink CLI demo application

use anyhow::Result;
use clap::{Parser, Subcommand, ValueEnum};
use ringlink_core::prelude::*;
use ringlink_core::{call_channel, personal_channel};
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(author, version, about)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run two signaling instances through a complete call flow
    Demo {
        /// Identity of the calling party
        #[arg(default_value = "alice")]
        caller: String,

        /// Identity of the called party
        #[arg(default_value = "bob")]
        callee: String,

        /// Media type to request
        #[arg(long, value_enum, default_value = "video")]
        call_type: CliCallType,

        /// Have the callee decline instead of accepting
        #[arg(long)]
        decline: bool,

        /// Let the ring time out unanswered
        #[arg(long)]
        no_answer: bool,
    },

    /// Print the channel names and call id for a pair of identities
    Channels {
        /// First identity
        a: String,
        /// Second identity
        b: String,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum CliCallType {
    Voice,
    Video,
}

impl From<CliCallType> for CallType {
    fn from(value: CliCallType) -> Self {
        match value {
            CliCallType::Voice => CallType::Voice,
            CliCallType::Video => CallType::Video,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing for debugging
    tracing_subscriber::fmt()
        .with_env_filter("ringlink=info")
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Demo {
            caller,
            callee,
            call_type,
            decline,
            no_answer,
        } => {
            handle_demo(&caller, &callee, call_type.into(), decline, no_answer).await?;
        }
        Commands::Channels { a, b } => {
            handle_channels(&a, &b);
        }
    }

    Ok(())
}

/// Prints every callback a signaling instance fires, tagged with its identity
struct Printer {
    label: String,
}

impl Printer {
    fn new(label: &str) -> Arc<Self> {
        Arc::new(Self {
            label: label.to_string(),
        })
    }
}

impl CallSignalingEvents for Printer {
    fn on_incoming_call(&self, signal: &CallSignal) {
        println!(
            "📞 [{}] incoming {:?} call from {} ({})",
            self.label, signal.call_type, signal.caller_name, signal.call_id
        );
    }

    fn on_call_accepted(&self, signal: &CallSignal) {
        println!("✅ [{}] {} accepted the call", self.label, signal.receiver_id);
    }

    fn on_call_declined(&self, signal: &CallSignal) {
        if signal.status == CallStatus::Busy {
            println!("⛔ [{}] {} is busy", self.label, signal.receiver_id);
        } else {
            println!("❌ [{}] {} declined the call", self.label, signal.receiver_id);
        }
    }

    fn on_call_ended(&self, signal: &CallSignal) {
        println!("👋 [{}] call {} ended", self.label, signal.call_id);
    }

    fn on_call_missed(&self, signal: &CallSignal) {
        println!("🔕 [{}] call {} went unanswered", self.label, signal.call_id);
    }
}

async fn handle_demo(
    caller: &str,
    callee: &str,
    call_type: CallType,
    decline: bool,
    no_answer: bool,
) -> Result<()> {
    let transport = Arc::new(MemoryTransport::new());

    // A short ring timeout so the --no-answer path finishes quickly
    let config = SignalingConfig {
        ring_timeout: Duration::from_secs(3),
        ..SignalingConfig::default()
    };
    let calling_side = CallSignaling::with_config(Arc::clone(&transport), config.clone());
    let called_side = CallSignaling::with_config(Arc::clone(&transport), config);

    calling_side.initialize(caller, Printer::new(caller)).await?;
    called_side.initialize(callee, Printer::new(callee)).await?;
    settle().await;

    let call_id = generate_call_id(caller, callee);
    println!("🔔 {caller} ringing {callee} ({call_type:?}, call {call_id})");
    if !calling_side
        .initiate_call(&call_id, callee, caller, None, call_type)
        .await
    {
        anyhow::bail!("failed to initiate the call");
    }
    settle().await;

    if no_answer {
        println!("… nobody answers");
        tokio::time::sleep(Duration::from_secs(4)).await;
    } else if decline {
        called_side.decline_call(&call_id).await;
        settle().await;
    } else {
        called_side.accept_call(&call_id).await;
        settle().await;
        println!("🎥 call established, hanging up");
        calling_side.end_call().await;
        settle().await;
    }

    calling_side.cleanup().await;
    called_side.cleanup().await;
    println!("✨ demo complete");
    Ok(())
}

fn handle_channels(a: &str, b: &str) {
    let call_id = generate_call_id(a, b);
    println!("call id:          {call_id}");
    println!("{a} inbox:        {}", personal_channel(a));
    println!("{b} inbox:        {}", personal_channel(b));
    println!("per-call channel: {}", call_channel(&call_id));
}

/// Give the in-process reader tasks a moment to deliver events
async fn settle() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}
