//! The datagram control plane.
//!
//! Small packets over UDP or a local unix datagram socket drive runtime
//! administration: fading nodes, querying node status, toggling discovery,
//! adjusting verbosity, reloading persisted state. State-changing commands
//! are only honoured from the unix socket; malformed packets are logged and
//! dropped without a reply to avoid amplification.

use bytes::Bytes;
use thiserror::Error;
use tidegate_core::drain::DrainWatcher;
use tidegate_core::telemetry;
use tokio::net::{UdpSocket, UnixDatagram};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::*;

pub const CONTROL_MAGIC: u32 = 0x7467_6374;
const MAX_DATAGRAM: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum Command {
	Nop = 0,
	/// Flush the translation cache. The cache itself is an external
	/// collaborator; the command is accepted for compatibility.
	TcacheInvalidate = 1,
	EnableNode = 3,
	FadeNode = 4,
	NodeStatus = 5,
	Verbose = 7,
	/// Retained for compatibility; does nothing.
	FadeChildren = 8,
	DisableDiscovery = 9,
	EnableDiscovery = 10,
	ReloadState = 11,
}

impl TryFrom<u16> for Command {
	type Error = ();

	fn try_from(value: u16) -> Result<Self, ()> {
		Ok(match value {
			0 => Command::Nop,
			1 => Command::TcacheInvalidate,
			3 => Command::EnableNode,
			4 => Command::FadeNode,
			5 => Command::NodeStatus,
			7 => Command::Verbose,
			8 => Command::FadeChildren,
			9 => Command::DisableDiscovery,
			10 => Command::EnableDiscovery,
			11 => Command::ReloadState,
			_ => return Err(()),
		})
	}
}

#[derive(Error, Debug, PartialEq)]
pub enum CodecError {
	#[error("datagram too short")]
	Truncated,
	#[error("bad magic")]
	BadMagic,
}

/// Parses one datagram into its command records. Each record is a 4-byte
/// header (payload length, command id; big endian) followed by the payload,
/// padded to 4 bytes.
pub fn parse_datagram(buf: &[u8]) -> Result<Vec<(u16, Bytes)>, CodecError> {
	if buf.len() < 4 {
		return Err(CodecError::Truncated);
	}
	let magic = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]);
	if magic != CONTROL_MAGIC {
		return Err(CodecError::BadMagic);
	}
	let mut records = Vec::new();
	let mut pos = 4;
	while pos < buf.len() {
		if pos + 4 > buf.len() {
			return Err(CodecError::Truncated);
		}
		let length = u16::from_be_bytes([buf[pos], buf[pos + 1]]) as usize;
		let command = u16::from_be_bytes([buf[pos + 2], buf[pos + 3]]);
		pos += 4;
		if pos + length > buf.len() {
			return Err(CodecError::Truncated);
		}
		records.push((command, Bytes::copy_from_slice(&buf[pos..pos + length])));
		pos += length + padding(length);
	}
	Ok(records)
}

pub fn encode_packet(records: &[(Command, &[u8])]) -> Vec<u8> {
	let mut out = Vec::with_capacity(
		4 + records
			.iter()
			.map(|(_, p)| 4 + p.len() + padding(p.len()))
			.sum::<usize>(),
	);
	out.extend_from_slice(&CONTROL_MAGIC.to_be_bytes());
	for (command, payload) in records {
		out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
		out.extend_from_slice(&(*command as u16).to_be_bytes());
		out.extend_from_slice(payload);
		out.extend(std::iter::repeat_n(0u8, padding(payload.len())));
	}
	out
}

fn padding(len: usize) -> usize {
	(4 - len % 4) % 4
}

pub struct ControlServer {
	inputs: Arc<ProxyInputs>,
	discovery: watch::Sender<bool>,
}

impl ControlServer {
	pub fn new(inputs: Arc<ProxyInputs>, discovery: watch::Sender<bool>) -> Arc<Self> {
		Arc::new(ControlServer { inputs, discovery })
	}

	pub async fn run_udp(self: Arc<Self>, socket: UdpSocket, drain: DrainWatcher) {
		let shutdown = drain.wait_for_drain();
		tokio::pin!(shutdown);
		let mut buf = [0u8; MAX_DATAGRAM];
		loop {
			tokio::select! {
				res = socket.recv_from(&mut buf) => {
					let Ok((n, peer)) = res else { continue };
					// Internet senders are never privileged.
					let replies = self.handle_datagram(&buf[..n], false);
					if !replies.is_empty() {
						let records: Vec<(Command, &[u8])> =
							replies.iter().map(|(c, p)| (*c, p.as_slice())).collect();
						let _ = socket.send_to(&encode_packet(&records), peer).await;
					}
				}
				_ = &mut shutdown => return,
			}
		}
	}

	pub async fn run_unix(self: Arc<Self>, socket: UnixDatagram, drain: DrainWatcher) {
		let shutdown = drain.wait_for_drain();
		tokio::pin!(shutdown);
		let mut buf = [0u8; MAX_DATAGRAM];
		loop {
			tokio::select! {
				res = socket.recv_from(&mut buf) => {
					let Ok((n, peer)) = res else { continue };
					// Local senders carry credentials; they may change state.
					let replies = self.handle_datagram(&buf[..n], true);
					if replies.is_empty() {
						continue;
					}
					let Some(path) = peer.as_pathname() else {
						debug!("cannot reply to unbound control client");
						continue;
					};
					let records: Vec<(Command, &[u8])> =
						replies.iter().map(|(c, p)| (*c, p.as_slice())).collect();
					let _ = socket.send_to(&encode_packet(&records), path).await;
				}
				_ = &mut shutdown => return,
			}
		}
	}

	/// Processes one datagram and returns the reply records, if any.
	pub fn handle_datagram(&self, buf: &[u8], privileged: bool) -> Vec<(Command, Vec<u8>)> {
		let records = match parse_datagram(buf) {
			Ok(r) => r,
			Err(e) => {
				warn!("malformed control packet: {e}");
				return Vec::new();
			},
		};
		let mut replies = Vec::new();
		for (raw, payload) in records {
			let Ok(command) = Command::try_from(raw) else {
				debug!(command = raw, "unknown control command");
				continue;
			};
			if let Some(reply) = self.handle_command(command, &payload, privileged) {
				replies.push(reply);
			}
		}
		replies
	}

	fn handle_command(
		&self,
		command: Command,
		payload: &[u8],
		privileged: bool,
	) -> Option<(Command, Vec<u8>)> {
		debug!(?command, privileged, payload_length = payload.len(), "control packet");
		match command {
			Command::Nop => None,
			Command::TcacheInvalidate => {
				// The translation cache lives behind the resource-loader
				// boundary; nothing to flush here.
				debug!("TCACHE_INVALIDATE ignored; no local cache");
				None
			},
			Command::FadeChildren => None,
			Command::DisableDiscovery => {
				if privileged {
					info!("discovery disabled via control");
					let _ = self.discovery.send(false);
				}
				None
			},
			Command::EnableDiscovery => {
				if privileged {
					info!("discovery enabled via control");
					let _ = self.discovery.send(true);
				}
				None
			},
			Command::EnableNode => {
				if privileged {
					let Ok(payload) = std::str::from_utf8(payload) else {
						warn!("malformed ENABLE_NODE control packet");
						return None;
					};
					if self.inputs.stores.enable_node(payload, &self.inputs.failures) {
						info!(node = payload, "node enabled");
					} else {
						warn!("unknown node in ENABLE_NODE control packet");
					}
				}
				None
			},
			Command::FadeNode => {
				if privileged {
					let Ok(payload) = std::str::from_utf8(payload) else {
						warn!("malformed FADE_NODE control packet");
						return None;
					};
					if self.inputs.stores.fade_node(payload, &self.inputs.failures) {
						info!(node = payload, "node faded");
					} else {
						warn!("unknown node in FADE_NODE control packet");
					}
				}
				None
			},
			Command::NodeStatus => {
				let Ok(payload_str) = std::str::from_utf8(payload) else {
					warn!("malformed NODE_STATUS control packet");
					return Some((Command::NodeStatus, reply_status(payload, "malformed")));
				};
				let status = match self.inputs.stores.find_node_address(payload_str) {
					Some(address) => self
						.inputs
						.failures
						.get(Instant::now(), address)
						.as_str(),
					None => {
						if payload_str.split_once(':').is_none() {
							"malformed"
						} else {
							"unknown"
						}
					},
				};
				Some((Command::NodeStatus, reply_status(payload, status)))
			},
			Command::Verbose => {
				if privileged && payload.len() == 1 {
					let directive = telemetry::verbosity_to_directive(payload[0]);
					if let Err(e) = telemetry::set_level(false, directive) {
						warn!("failed to set log level: {e}");
					}
				}
				None
			},
			Command::ReloadState => {
				if privileged {
					self.inputs.stores.reload_state(&self.inputs.failures);
				}
				None
			},
		}
	}
}

/// Replies use `payload NUL status` framing.
fn reply_status(payload: &[u8], status: &str) -> Vec<u8> {
	let mut out = Vec::with_capacity(payload.len() + 1 + status.len());
	out.extend_from_slice(payload);
	out.push(0);
	out.extend_from_slice(status.as_bytes());
	out
}
