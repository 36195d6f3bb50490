pub mod local;

use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use ipnet::IpNet;
use serde::{Serialize, Serializer};

use crate::client::tls::BackendTls;
use crate::transport::tls::SslVerify;
use crate::*;

pub type ListenerName = Strng;
pub type ClusterName = Strng;
pub type BranchName = Strng;
pub type NodeName = Strng;
pub type MonitorName = Strng;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Protocol {
	Http,
	Tcp,
}

/// A statically configured backend host. Members reference nodes by name and
/// may override the port.
#[derive(Debug, Clone, Serialize)]
pub struct Node {
	pub name: NodeName,
	pub address: IpAddr,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub default_port: Option<u16>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub jvm_route: Option<Strng>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Member {
	pub name: Strng,
	pub address: SocketAddr,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub jvm_route: Option<Strng>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickyMode {
	#[default]
	None,
	Failover,
	SourceIp,
	Host,
	Xhost,
	SessionModulo,
	Cookie,
	JvmRoute,
}

/// How a sticky hash maps onto the member set of a discovered cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StickyMethod {
	#[default]
	ConsistentHashing,
	RendezvousHashing,
	Cache,
}

#[derive(Debug, Clone, Serialize)]
pub struct SimpleResponse {
	pub status: u16,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub location: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub message: Option<Strng>,
	/// Redirect to the https:// form of the request URI; `location` is
	/// computed per request.
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub redirect_https: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Goto {
	Cluster(ClusterName),
	Branch(BranchName),
	Response(SimpleResponse),
	MetricsExporter,
}

impl Goto {
	pub fn name(&self) -> Strng {
		match self {
			Goto::Cluster(n) => n.clone(),
			Goto::Branch(n) => n.clone(),
			Goto::Response(r) => strng::format!("response:{}", r.status),
			Goto::MetricsExporter => strng::literal!("metrics"),
		}
	}
}

#[derive(Debug, Clone, Serialize)]
pub struct Branch {
	pub name: BranchName,
	pub cases: Vec<BranchCase>,
	pub fallback: Goto,
}

#[derive(Debug, Clone, Serialize)]
pub struct BranchCase {
	pub condition: Condition,
	pub destination: Goto,
}

#[derive(Debug, Clone, Serialize)]
pub struct Condition {
	pub attribute: Attribute,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub negate: bool,
	pub matcher: Matcher,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Attribute {
	Method,
	Uri,
	RemoteAddress,
	PeerSubject,
	PeerIssuerSubject,
	Header(Strng),
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Matcher {
	Equals(Strng),
	Regex(
		#[serde(with = "serde_regex")]
		regex::Regex,
	),
	/// Masked-address membership; only legal for `remote_address`.
	Cidr(IpNet),
}

#[derive(Debug, Clone, Serialize)]
pub struct ClusterConfig {
	pub name: ClusterName,
	pub protocol: Protocol,
	pub members: Vec<Member>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub discovery: Option<DiscoveryConfig>,
	pub sticky_mode: StickyMode,
	pub sticky_method: StickyMethod,
	#[serde(default, skip_serializing_if = "std::ops::Not::not")]
	pub sticky_cache: bool,
	pub session_cookie: Strng,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub monitor: Option<MonitorName>,
	pub hsts: bool,
	pub tarpit: bool,
	pub transparent_source: bool,
	pub mangle_via: bool,
	pub fair_scheduling: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub http_host: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tls: Option<BackendTls>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub fallback: Option<SimpleResponse>,
}

/// Dynamic membership: the hostname is re-resolved on an interval and the
/// member set swapped in place.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveryConfig {
	pub hostname: Strng,
	pub port: u16,
	#[serde(with = "local::serde_duration")]
	pub refresh: Duration,
}

#[derive(Debug, Clone)]
pub struct ListenerTls {
	pub config: Arc<rustls::ServerConfig>,
	pub verify: SslVerify,
}

impl Serialize for ListenerTls {
	fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
	where
		S: Serializer,
	{
		self.verify.serialize(serializer)
	}
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct SocketOptions {
	#[serde(skip_serializing_if = "Option::is_none")]
	pub interface: Option<Strng>,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub v6only: Option<bool>,
	pub reuse_port: bool,
	pub free_bind: bool,
	pub mptcp: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub ack_timeout: Option<Duration>,
	pub keepalive: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct Listener {
	pub name: ListenerName,
	pub address: SocketAddr,
	pub protocol: Protocol,
	pub destination: Goto,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tls: Option<ListenerTls>,
	pub socket: SocketOptions,
	/// 0 means unlimited.
	pub max_connections_per_ip: usize,
	pub hsts: bool,
	pub verbose_response: bool,
	pub force_http2: bool,
	pub alpn_http2: bool,
	#[serde(skip_serializing_if = "Option::is_none")]
	pub tag: Option<Strng>,
	pub access_log_only_errors: bool,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum MonitorKind {
	/// A bare TCP connect.
	Ping,
	/// Send a blob, expect a substring back.
	TcpExpect {
		#[serde(skip_serializing_if = "Option::is_none")]
		send: Option<Strng>,
		expect: Strng,
		#[serde(skip_serializing_if = "Option::is_none")]
		expect_graceful: Option<Strng>,
	},
	/// GET a URI, expect a 2xx/3xx.
	Http {
		uri: Strng,
		#[serde(skip_serializing_if = "Option::is_none")]
		host: Option<Strng>,
	},
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorConfig {
	pub name: MonitorName,
	#[serde(flatten)]
	pub kind: MonitorKind,
	#[serde(with = "local::serde_duration")]
	pub interval: Duration,
	#[serde(with = "local::serde_duration")]
	pub timeout: Duration,
}

/// A synthetic health endpoint answered by the balancer itself, gated on a
/// marker file.
#[derive(Debug, Clone, Serialize)]
pub struct HttpCheckConfig {
	pub uri: Strng,
	pub host: Strng,
	pub clients: Vec<IpAddr>,
	pub file_exists: PathBuf,
	pub success_message: Strng,
}

impl HttpCheckConfig {
	pub fn matches(&self, uri: &str, host: &str, client: IpAddr) -> bool {
		if uri != self.uri.as_str() || host != self.host.as_str() {
			return false;
		}
		self.clients.is_empty() || self.clients.contains(&client)
	}

	pub fn check(&self) -> bool {
		self.file_exists.exists()
	}
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlBind {
	Udp(SocketAddr),
	Unix(PathBuf),
}

#[derive(Debug, Clone, Serialize)]
pub struct ControlConfig {
	pub bind: ControlBind,
}
