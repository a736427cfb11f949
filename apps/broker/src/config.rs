//! Broker configuration: CLI arguments with environment fallbacks

use clap::Parser;
use std::time::Duration;
use tunnel_common::constants::{
    DEFAULT_INGRESS_ADDR, DEFAULT_TUNNEL_ADDR, MAX_BODY_SIZE_BYTES, MAX_FRAME_SIZE_BYTES,
    OUTBOUND_QUEUE_CAPACITY, REQUEST_TIMEOUT_SECS, SESSION_TTL_SECS,
};

/// CLI arguments for the broker
#[derive(Parser, Debug)]
#[command(name = "tunnel-broker")]
#[command(about = "Reverse tunnel broker", long_about = None)]
#[command(version)]
pub struct Args {
    /// Public HTTP listen address
    #[arg(long, env = "TUNNEL_INGRESS_ADDR", default_value = DEFAULT_INGRESS_ADDR)]
    pub ingress_addr: String,

    /// Listen address for agent tunnel connections
    #[arg(long, env = "TUNNEL_TUNNEL_ADDR", default_value = DEFAULT_TUNNEL_ADDR)]
    pub tunnel_addr: String,

    /// Base URL announced to agents as the prefix of their public endpoint
    #[arg(long, env = "TUNNEL_PUBLIC_URL", default_value = "http://localhost:3000")]
    pub public_url: String,

    /// Absolute session lifetime in seconds (not refreshed on activity)
    #[arg(long, env = "TUNNEL_SESSION_TTL_SECS", default_value_t = SESSION_TTL_SECS)]
    pub session_ttl_secs: u64,

    /// Seconds to wait for an agent to answer before responding 504
    #[arg(long, env = "TUNNEL_REQUEST_TIMEOUT_SECS", default_value_t = REQUEST_TIMEOUT_SECS)]
    pub request_timeout_secs: u64,

    /// Largest tunnel frame accepted or produced, in bytes
    #[arg(long, env = "TUNNEL_MAX_FRAME_BYTES", default_value_t = MAX_FRAME_SIZE_BYTES)]
    pub max_frame_bytes: usize,

    /// Enable verbose logging
    #[arg(short, long)]
    pub verbose: bool,
}

/// Runtime configuration shared by both servers
#[derive(Debug, Clone)]
pub struct Config {
    pub ingress_addr: String,
    pub tunnel_addr: String,
    pub public_url: String,
    pub session_ttl: Duration,
    pub request_timeout: Duration,
    pub max_frame_bytes: usize,
    pub max_body_bytes: usize,
    pub outbound_queue_capacity: usize,
}

impl Config {
    pub fn from_args(args: &Args) -> Self {
        Self {
            ingress_addr: args.ingress_addr.clone(),
            tunnel_addr: args.tunnel_addr.clone(),
            public_url: args.public_url.clone(),
            session_ttl: Duration::from_secs(args.session_ttl_secs),
            request_timeout: Duration::from_secs(args.request_timeout_secs),
            max_frame_bytes: args.max_frame_bytes,
            // Leave room for the request line and headers inside one frame
            max_body_bytes: MAX_BODY_SIZE_BYTES.min(args.max_frame_bytes / 2),
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            ingress_addr: DEFAULT_INGRESS_ADDR.to_string(),
            tunnel_addr: DEFAULT_TUNNEL_ADDR.to_string(),
            public_url: "http://localhost:3000".to_string(),
            session_ttl: Duration::from_secs(SESSION_TTL_SECS),
            request_timeout: Duration::from_secs(REQUEST_TIMEOUT_SECS),
            max_frame_bytes: MAX_FRAME_SIZE_BYTES,
            max_body_bytes: MAX_BODY_SIZE_BYTES,
            outbound_queue_capacity: OUTBOUND_QUEUE_CAPACITY,
        }
    }
}
