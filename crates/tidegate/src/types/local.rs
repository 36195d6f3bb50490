//! On-disk configuration model.
//!
//! The YAML file is deserialized into the `Local*` structures and then
//! normalized into the runtime model in [`super`]: names are resolved,
//! member ports computed, TLS material loaded, and the structural invariants
//! checked. Everything that can fail, fails here, before any socket is
//! bound.

use std::collections::{HashMap, HashSet};
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use serde::Deserialize;

use super::*;
use crate::*;
use crate::client::tls::build_backend_tls;
use crate::transport::tls::{SslVerify, build_server_config};

pub mod serde_duration {
	use std::time::Duration;

	use serde::{Deserialize, Deserializer, Serializer};

	pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
		s.serialize_u64(d.as_secs())
	}

	pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
		Ok(Duration::from_secs(u64::deserialize(d)?))
	}
}

fn default_true() -> bool {
	true
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalConfig {
	#[serde(default)]
	pub config: Settings,
	#[serde(default)]
	pub nodes: Vec<LocalNode>,
	#[serde(default)]
	pub clusters: Vec<LocalCluster>,
	#[serde(default)]
	pub branches: Vec<LocalBranch>,
	#[serde(default)]
	pub listeners: Vec<LocalListener>,
	#[serde(default)]
	pub monitors: Vec<LocalMonitor>,
	#[serde(default)]
	pub controls: Vec<LocalControl>,
	#[serde(default)]
	pub exporters: Vec<Strng>,
	#[serde(default)]
	pub global_http_check: Option<LocalHttpCheck>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Settings {
	#[serde(default = "default_stock_limit")]
	pub stock_limit: usize,
	#[serde(default = "default_stock_max_idle")]
	pub stock_max_idle: usize,
	/// Upstream connect timeout, seconds.
	#[serde(default = "default_connect_timeout", with = "serde_duration")]
	pub connect_timeout: Duration,
	/// How long to wait for a backend to start answering, seconds.
	#[serde(default = "default_response_timeout", with = "serde_duration")]
	pub response_timeout: Duration,
	/// How long draining connections are given on shutdown, seconds.
	#[serde(default = "default_termination_deadline", with = "serde_duration")]
	pub termination_deadline: Duration,
	/// 0 picks the number of available CPUs.
	#[serde(default)]
	pub worker_threads: usize,
	#[serde(default)]
	pub state_file: Option<PathBuf>,
}

fn default_stock_limit() -> usize {
	256
}
fn default_stock_max_idle() -> usize {
	16
}
fn default_connect_timeout() -> Duration {
	Duration::from_secs(20)
}
fn default_response_timeout() -> Duration {
	Duration::from_secs(30)
}
fn default_termination_deadline() -> Duration {
	Duration::from_secs(10)
}

impl Default for Settings {
	fn default() -> Self {
		Settings {
			stock_limit: default_stock_limit(),
			stock_max_idle: default_stock_max_idle(),
			connect_timeout: default_connect_timeout(),
			response_timeout: default_response_timeout(),
			termination_deadline: default_termination_deadline(),
			worker_threads: 0,
			state_file: None,
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalNode {
	pub name: Strng,
	/// `ip` or `ip:port`; the port becomes the default for members that do
	/// not carry their own.
	pub address: String,
	#[serde(default)]
	pub jvm_route: Option<Strng>,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LocalMember {
	/// `"node"` or `"node:port"`
	Shorthand(String),
	Full {
		node: Strng,
		#[serde(default)]
		port: Option<u16>,
	},
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalCluster {
	pub name: Strng,
	#[serde(default = "default_protocol")]
	pub protocol: Protocol,
	#[serde(default)]
	pub members: Vec<LocalMember>,
	#[serde(default)]
	pub discovery: Option<LocalDiscovery>,
	#[serde(default)]
	pub sticky: StickyMode,
	#[serde(default)]
	pub sticky_method: StickyMethod,
	#[serde(default)]
	pub sticky_cache: bool,
	#[serde(default = "default_session_cookie")]
	pub session_cookie: Strng,
	#[serde(default)]
	pub monitor: Option<MonitorName>,
	#[serde(default)]
	pub hsts: bool,
	#[serde(default)]
	pub tarpit: bool,
	#[serde(default)]
	pub transparent_source: bool,
	#[serde(default)]
	pub mangle_via: bool,
	#[serde(default)]
	pub fair_scheduling: bool,
	#[serde(default)]
	pub http_host: Option<Strng>,
	#[serde(default)]
	pub ssl: bool,
	#[serde(default)]
	pub ssl_ca_cert: Option<PathBuf>,
	#[serde(default)]
	pub ssl_name: Option<Strng>,
	#[serde(default)]
	pub fallback: Option<LocalResponse>,
}

fn default_protocol() -> Protocol {
	Protocol::Http
}
fn default_session_cookie() -> Strng {
	strng::literal!("session")
}

impl<'de> Deserialize<'de> for Protocol {
	fn deserialize<D: serde::Deserializer<'de>>(d: D) -> Result<Self, D::Error> {
		let s = String::deserialize(d)?;
		match s.as_str() {
			"http" => Ok(Protocol::Http),
			"tcp" => Ok(Protocol::Tcp),
			other => Err(serde::de::Error::custom(format!(
				"unknown protocol {other:?}"
			))),
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalDiscovery {
	pub hostname: Strng,
	pub port: u16,
	#[serde(default = "default_discovery_refresh", with = "serde_duration")]
	pub refresh: Duration,
}

fn default_discovery_refresh() -> Duration {
	Duration::from_secs(30)
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalResponse {
	pub status: u16,
	#[serde(default)]
	pub location: Option<Strng>,
	#[serde(default)]
	pub message: Option<Strng>,
	#[serde(default)]
	pub redirect_https: bool,
}

impl LocalResponse {
	fn build(&self) -> SimpleResponse {
		SimpleResponse {
			status: self.status,
			location: self.location.clone(),
			message: self.message.clone(),
			redirect_https: self.redirect_https,
		}
	}
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum LocalGoto {
	Name(Strng),
	Response(LocalResponse),
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalCase {
	pub attribute: String,
	#[serde(default)]
	pub header: Option<Strng>,
	#[serde(default)]
	pub negate: bool,
	#[serde(default)]
	pub equals: Option<Strng>,
	#[serde(default, with = "serde_regex")]
	pub regex: Option<regex::Regex>,
	#[serde(default)]
	pub cidr: Option<ipnet::IpNet>,
	#[serde(rename = "goto")]
	pub destination: LocalGoto,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalBranch {
	pub name: Strng,
	#[serde(default)]
	pub cases: Vec<LocalCase>,
	pub fallback: LocalGoto,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalListener {
	pub name: Strng,
	pub bind: String,
	#[serde(default = "default_protocol")]
	pub protocol: Protocol,
	#[serde(default)]
	pub pool: Option<LocalGoto>,
	#[serde(default)]
	pub ssl: bool,
	#[serde(default)]
	pub ssl_cert: Option<PathBuf>,
	#[serde(default)]
	pub ssl_key: Option<PathBuf>,
	#[serde(default)]
	pub ssl_ca_cert: Option<PathBuf>,
	#[serde(default)]
	pub ssl_verify: SslVerify,
	#[serde(default = "default_true")]
	pub alpn_http2: bool,
	#[serde(default)]
	pub force_http2: bool,
	#[serde(default)]
	pub hsts: bool,
	#[serde(default)]
	pub verbose_response: bool,
	#[serde(default)]
	pub redirect_https: bool,
	#[serde(default)]
	pub max_connections_per_ip: usize,
	#[serde(default)]
	pub interface: Option<Strng>,
	#[serde(default)]
	pub v6only: Option<bool>,
	#[serde(default)]
	pub reuse_port: bool,
	#[serde(default)]
	pub free_bind: bool,
	#[serde(default)]
	pub mptcp: bool,
	#[serde(default)]
	pub keepalive: bool,
	/// TCP_USER_TIMEOUT, seconds.
	#[serde(default)]
	pub ack_timeout: Option<u64>,
	#[serde(default)]
	pub tag: Option<Strng>,
	#[serde(default)]
	pub access_logger_only_errors: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalMonitor {
	pub name: Strng,
	#[serde(rename = "type")]
	pub kind: String,
	#[serde(default)]
	pub send: Option<Strng>,
	#[serde(default)]
	pub expect: Option<Strng>,
	#[serde(default)]
	pub expect_graceful: Option<Strng>,
	#[serde(default)]
	pub uri: Option<Strng>,
	#[serde(default)]
	pub host: Option<Strng>,
	#[serde(default = "default_monitor_interval", with = "serde_duration")]
	pub interval: Duration,
	#[serde(default = "default_monitor_timeout", with = "serde_duration")]
	pub timeout: Duration,
}

fn default_monitor_interval() -> Duration {
	Duration::from_secs(10)
}
fn default_monitor_timeout() -> Duration {
	Duration::from_secs(30)
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalControl {
	#[serde(default)]
	pub bind: Option<String>,
	#[serde(default)]
	pub unix: Option<PathBuf>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LocalHttpCheck {
	pub uri: Strng,
	pub host: Strng,
	#[serde(default)]
	pub clients: Vec<IpAddr>,
	pub file_exists: PathBuf,
	#[serde(default = "default_success_message")]
	pub success_message: Strng,
}

fn default_success_message() -> Strng {
	strng::literal!("ok")
}

/// The fully resolved configuration, ready to seed the stores.
#[derive(Debug)]
pub struct NormalizedConfig {
	pub settings: Settings,
	pub nodes: HashMap<NodeName, Arc<Node>>,
	pub clusters: Vec<ClusterConfig>,
	pub branches: HashMap<BranchName, Arc<Branch>>,
	pub listeners: Vec<Arc<Listener>>,
	pub monitors: HashMap<MonitorName, Arc<MonitorConfig>>,
	pub controls: Vec<ControlConfig>,
	pub global_http_check: Option<Arc<HttpCheckConfig>>,
}

pub fn parse(contents: &str) -> anyhow::Result<LocalConfig> {
	serde_yaml::from_str(contents).context("failed to parse configuration")
}

pub fn normalize(local: LocalConfig) -> anyhow::Result<NormalizedConfig> {
	let mut nodes = HashMap::new();
	for n in &local.nodes {
		let (address, default_port) = parse_node_address(&n.address)
			.with_context(|| format!("node {:?}", n.name.as_str()))?;
		let node = Arc::new(Node {
			name: n.name.clone(),
			address,
			default_port,
			jvm_route: n.jvm_route.clone(),
		});
		if nodes.insert(n.name.clone(), node).is_some() {
			bail!("duplicate node {:?}", n.name.as_str());
		}
	}

	let cluster_protocols: HashMap<Strng, Protocol> = local
		.clusters
		.iter()
		.map(|c| (c.name.clone(), c.protocol))
		.collect();
	let branch_names: HashSet<Strng> = local.branches.iter().map(|b| b.name.clone()).collect();
	let exporters: HashSet<Strng> = local.exporters.iter().cloned().collect();

	let resolve_goto = |g: &LocalGoto| -> anyhow::Result<Goto> {
		match g {
			LocalGoto::Response(r) => Ok(Goto::Response(r.build())),
			LocalGoto::Name(name) => {
				if cluster_protocols.contains_key(name) {
					Ok(Goto::Cluster(name.clone()))
				} else if branch_names.contains(name) {
					Ok(Goto::Branch(name.clone()))
				} else if exporters.contains(name) {
					Ok(Goto::MetricsExporter)
				} else {
					bail!("unknown pool {:?}", name.as_str())
				}
			},
		}
	};

	let mut branches = HashMap::new();
	for b in &local.branches {
		let mut cases = Vec::with_capacity(b.cases.len());
		for c in &b.cases {
			cases.push(BranchCase {
				condition: build_condition(c)
					.with_context(|| format!("branch {:?}", b.name.as_str()))?,
				destination: resolve_goto(&c.destination)?,
			});
		}
		let branch = Arc::new(Branch {
			name: b.name.clone(),
			cases,
			fallback: resolve_goto(&b.fallback)?,
		});
		if branches.insert(b.name.clone(), branch).is_some() {
			bail!("duplicate branch {:?}", b.name.as_str());
		}
	}

	// All destinations reachable from a branch must agree on the protocol.
	for b in branches.values() {
		let mut seen = HashSet::new();
		branch_protocol(b, &branches, &cluster_protocols, &mut seen)
			.with_context(|| format!("branch {:?}", b.name.as_str()))?;
	}

	let mut clusters = Vec::with_capacity(local.clusters.len());
	for c in &local.clusters {
		clusters.push(build_cluster(c, &nodes, &local.monitors)?);
	}

	let mut monitors = HashMap::new();
	for m in &local.monitors {
		let kind = match m.kind.as_str() {
			"ping" => MonitorKind::Ping,
			"tcp_expect" => MonitorKind::TcpExpect {
				send: m.send.clone(),
				expect: m
					.expect
					.clone()
					.ok_or_else(|| anyhow!("monitor {:?}: tcp_expect requires expect", m.name.as_str()))?,
				expect_graceful: m.expect_graceful.clone(),
			},
			"http" => MonitorKind::Http {
				uri: m
					.uri
					.clone()
					.ok_or_else(|| anyhow!("monitor {:?}: http requires uri", m.name.as_str()))?,
				host: m.host.clone(),
			},
			other => bail!("monitor {:?}: unknown type {other:?}", m.name.as_str()),
		};
		let mc = Arc::new(MonitorConfig {
			name: m.name.clone(),
			kind,
			interval: m.interval,
			timeout: m.timeout,
		});
		if monitors.insert(m.name.clone(), mc).is_some() {
			bail!("duplicate monitor {:?}", m.name.as_str());
		}
	}

	let mut listeners = Vec::with_capacity(local.listeners.len());
	for l in &local.listeners {
		listeners.push(Arc::new(build_listener(
			l,
			&resolve_goto,
			&branches,
			&cluster_protocols,
		)?));
	}

	let controls = local
		.controls
		.iter()
		.map(|c| match (&c.bind, &c.unix) {
			(Some(addr), None) => Ok(ControlConfig {
				bind: ControlBind::Udp(addr.parse().context("control bind")?),
			}),
			(None, Some(path)) => Ok(ControlConfig {
				bind: ControlBind::Unix(path.clone()),
			}),
			_ => bail!("control requires exactly one of bind or unix"),
		})
		.collect::<anyhow::Result<Vec<_>>>()?;

	let global_http_check = local.global_http_check.as_ref().map(|c| {
		Arc::new(HttpCheckConfig {
			uri: c.uri.clone(),
			host: c.host.clone(),
			clients: c.clients.clone(),
			file_exists: c.file_exists.clone(),
			success_message: c.success_message.clone(),
		})
	});

	Ok(NormalizedConfig {
		settings: local.config,
		nodes,
		clusters,
		branches,
		listeners,
		monitors,
		controls,
		global_http_check,
	})
}

fn parse_node_address(s: &str) -> anyhow::Result<(IpAddr, Option<u16>)> {
	if let Ok(sa) = s.parse::<SocketAddr>() {
		return Ok((sa.ip(), Some(sa.port())));
	}
	let ip = s
		.parse::<IpAddr>()
		.with_context(|| format!("invalid node address {s:?}"))?;
	Ok((ip, None))
}

fn build_condition(c: &LocalCase) -> anyhow::Result<Condition> {
	let attribute = match c.attribute.as_str() {
		"method" => Attribute::Method,
		"uri" | "request_uri" => Attribute::Uri,
		"remote_address" => Attribute::RemoteAddress,
		"peer_subject" => Attribute::PeerSubject,
		"peer_issuer_subject" => Attribute::PeerIssuerSubject,
		"header" => Attribute::Header(
			c.header
				.clone()
				.ok_or_else(|| anyhow!("header condition requires header name"))?,
		),
		other => bail!("unknown condition attribute {other:?}"),
	};
	let matcher = match (&c.equals, &c.regex, &c.cidr) {
		(Some(v), None, None) => Matcher::Equals(v.clone()),
		(None, Some(re), None) => Matcher::Regex(re.clone()),
		(None, None, Some(net)) => {
			if attribute != Attribute::RemoteAddress {
				bail!("cidr matcher is only valid for remote_address");
			}
			Matcher::Cidr(*net)
		},
		_ => bail!("condition requires exactly one of equals, regex, cidr"),
	};
	Ok(Condition {
		attribute,
		negate: c.negate,
		matcher,
	})
}

fn branch_protocol(
	b: &Branch,
	branches: &HashMap<BranchName, Arc<Branch>>,
	clusters: &HashMap<Strng, Protocol>,
	seen: &mut HashSet<Strng>,
) -> anyhow::Result<Protocol> {
	if !seen.insert(b.name.clone()) {
		bail!("branch cycle through {:?}", b.name.as_str());
	}
	let mut proto = None;
	let mut check = |p: Protocol| -> anyhow::Result<()> {
		match proto {
			None => {
				proto = Some(p);
				Ok(())
			},
			Some(existing) if existing == p => Ok(()),
			Some(_) => bail!("destinations mix protocols"),
		}
	};
	let destinations = b
		.cases
		.iter()
		.map(|c| &c.destination)
		.chain(std::iter::once(&b.fallback));
	for g in destinations {
		let p = match g {
			Goto::Cluster(name) => *clusters
				.get(name)
				.ok_or_else(|| anyhow!("unknown cluster {:?}", name.as_str()))?,
			Goto::Branch(name) => {
				let inner = branches
					.get(name)
					.ok_or_else(|| anyhow!("unknown branch {:?}", name.as_str()))?;
				branch_protocol(inner, branches, clusters, seen)?
			},
			Goto::Response(_) | Goto::MetricsExporter => Protocol::Http,
		};
		check(p)?;
	}
	seen.remove(&b.name);
	Ok(proto.unwrap_or(Protocol::Http))
}

fn build_cluster(
	c: &LocalCluster,
	nodes: &HashMap<NodeName, Arc<Node>>,
	monitors: &[LocalMonitor],
) -> anyhow::Result<ClusterConfig> {
	let mut members = Vec::with_capacity(c.members.len());
	for m in &c.members {
		let (node_name, port) = match m {
			LocalMember::Shorthand(s) => match s.rsplit_once(':') {
				Some((name, port)) => (
					strng::new(name),
					Some(port.parse::<u16>().with_context(|| {
						format!("cluster {:?}: bad member port in {s:?}", c.name.as_str())
					})?),
				),
				None => (strng::new(s), None),
			},
			LocalMember::Full { node, port } => (node.clone(), *port),
		};
		let node = nodes.get(&node_name).ok_or_else(|| {
			anyhow!(
				"cluster {:?}: unknown node {:?}",
				c.name.as_str(),
				node_name.as_str()
			)
		})?;
		let port = port.or(node.default_port).ok_or_else(|| {
			anyhow!(
				"cluster {:?}: member {:?} has no port",
				c.name.as_str(),
				node_name.as_str()
			)
		})?;
		members.push(Member {
			name: node.name.clone(),
			address: SocketAddr::new(node.address, port),
			jvm_route: node.jvm_route.clone(),
		});
	}
	if members.is_empty() && c.discovery.is_none() {
		bail!("cluster {:?} has no members", c.name.as_str());
	}
	if let Some(monitor) = &c.monitor
		&& !monitors.iter().any(|m| &m.name == monitor)
	{
		bail!(
			"cluster {:?}: unknown monitor {:?}",
			c.name.as_str(),
			monitor.as_str()
		);
	}

	// A single member leaves nothing to steer; sticky bookkeeping would only
	// cost cycles.
	let sticky_mode = if members.len() == 1 && c.discovery.is_none() {
		StickyMode::None
	} else {
		c.sticky
	};

	let tls = if c.ssl {
		let ca = match &c.ssl_ca_cert {
			Some(path) => Some(
				std::fs::read(path)
					.with_context(|| format!("cluster {:?}: reading ssl_ca_cert", c.name.as_str()))?,
			),
			None => None,
		};
		Some(build_backend_tls(
			c.name.clone(),
			ca.as_deref(),
			c.ssl_name.clone(),
		)?)
	} else {
		None
	};

	Ok(ClusterConfig {
		name: c.name.clone(),
		protocol: c.protocol,
		members,
		discovery: c.discovery.as_ref().map(|d| DiscoveryConfig {
			hostname: d.hostname.clone(),
			port: d.port,
			refresh: d.refresh,
		}),
		sticky_mode,
		sticky_method: c.sticky_method,
		sticky_cache: c.sticky_cache,
		session_cookie: c.session_cookie.clone(),
		monitor: c.monitor.clone(),
		hsts: c.hsts,
		tarpit: c.tarpit,
		transparent_source: c.transparent_source,
		mangle_via: c.mangle_via,
		fair_scheduling: c.fair_scheduling,
		http_host: c.http_host.clone(),
		tls,
		fallback: c.fallback.as_ref().map(|f| f.build()),
	})
}

fn build_listener(
	l: &LocalListener,
	resolve_goto: &impl Fn(&LocalGoto) -> anyhow::Result<Goto>,
	branches: &HashMap<BranchName, Arc<Branch>>,
	cluster_protocols: &HashMap<Strng, Protocol>,
) -> anyhow::Result<Listener> {
	let address: SocketAddr = l
		.bind
		.parse()
		.with_context(|| format!("listener {:?}: bad bind address", l.name.as_str()))?;

	let tls = if l.ssl {
		let cert = l
			.ssl_cert
			.as_ref()
			.ok_or_else(|| anyhow!("listener {:?}: ssl requires ssl_cert", l.name.as_str()))?;
		let key = l
			.ssl_key
			.as_ref()
			.ok_or_else(|| anyhow!("listener {:?}: ssl requires ssl_key", l.name.as_str()))?;
		let cert = std::fs::read(cert).context("reading ssl_cert")?;
		let key = std::fs::read(key).context("reading ssl_key")?;
		let ca = match &l.ssl_ca_cert {
			Some(p) => Some(std::fs::read(p).context("reading ssl_ca_cert")?),
			None => None,
		};
		Some(ListenerTls {
			config: build_server_config(&cert, &key, ca.as_deref(), l.ssl_verify, l.alpn_http2)?,
			verify: l.ssl_verify,
		})
	} else {
		None
	};

	if l.hsts && l.protocol != Protocol::Http {
		bail!("listener {:?}: hsts is only valid for http", l.name.as_str());
	}
	if l.redirect_https && tls.is_some() {
		bail!(
			"listener {:?}: redirect_https only applies to plaintext listeners",
			l.name.as_str()
		);
	}

	let destination = if l.redirect_https {
		Goto::Response(SimpleResponse {
			status: 301,
			location: None,
			message: None,
			redirect_https: true,
		})
	} else {
		let pool = l
			.pool
			.as_ref()
			.ok_or_else(|| anyhow!("listener {:?}: pool is required", l.name.as_str()))?;
		resolve_goto(pool)?
	};

	// The destination's protocol must match the listener's.
	let dest_proto = match &destination {
		Goto::Cluster(name) => *cluster_protocols
			.get(name)
			.ok_or_else(|| anyhow!("unknown cluster {:?}", name.as_str()))?,
		Goto::Branch(name) => {
			let b = branches
				.get(name)
				.ok_or_else(|| anyhow!("unknown branch {:?}", name.as_str()))?;
			let mut seen = HashSet::new();
			branch_protocol(b, branches, cluster_protocols, &mut seen)?
		},
		Goto::Response(_) | Goto::MetricsExporter => Protocol::Http,
	};
	if dest_proto != l.protocol {
		bail!(
			"listener {:?}: destination protocol does not match listener protocol",
			l.name.as_str()
		);
	}

	Ok(Listener {
		name: l.name.clone(),
		address,
		protocol: l.protocol,
		destination,
		tls,
		socket: SocketOptions {
			interface: l.interface.clone(),
			v6only: l.v6only,
			reuse_port: l.reuse_port,
			free_bind: l.free_bind,
			mptcp: l.mptcp,
			ack_timeout: l.ack_timeout.map(Duration::from_secs),
			keepalive: l.keepalive,
		},
		max_connections_per_ip: l.max_connections_per_ip,
		hsts: l.hsts,
		verbose_response: l.verbose_response,
		force_http2: l.force_http2,
		alpn_http2: l.alpn_http2,
		tag: l.tag.clone(),
		access_log_only_errors: l.access_logger_only_errors,
	})
}

#[cfg(test)]
mod tests {
	use super::*;

	const BASIC: &str = r#"
nodes:
  - name: web1
    address: 192.168.0.10:8080
  - name: web2
    address: 192.168.0.11
clusters:
  - name: web
    members: ["web1", "web2:8081"]
    sticky: cookie
listeners:
  - name: main
    bind: 127.0.0.1:0
    pool: web
"#;

	#[test]
	fn parses_and_normalizes_basic_config() {
		let local = parse(BASIC).unwrap();
		let norm = normalize(local).unwrap();
		assert_eq!(norm.clusters.len(), 1);
		let c = &norm.clusters[0];
		assert_eq!(c.members.len(), 2);
		assert_eq!(c.members[0].address, "192.168.0.10:8080".parse().unwrap());
		assert_eq!(c.members[1].address, "192.168.0.11:8081".parse().unwrap());
		assert_eq!(c.sticky_mode, StickyMode::Cookie);
		assert_eq!(norm.listeners.len(), 1);
	}

	#[test]
	fn member_without_port_is_rejected() {
		let cfg = r#"
nodes:
  - name: a
    address: 10.0.0.1
clusters:
  - name: c
    members: ["a"]
"#;
		let err = normalize(parse(cfg).unwrap()).unwrap_err();
		assert!(err.to_string().contains("no port"), "{err}");
	}

	#[test]
	fn single_member_forces_sticky_none() {
		let cfg = r#"
nodes:
  - name: a
    address: 10.0.0.1:80
clusters:
  - name: c
    members: ["a"]
    sticky: source_ip
"#;
		let norm = normalize(parse(cfg).unwrap()).unwrap();
		assert_eq!(norm.clusters[0].sticky_mode, StickyMode::None);
	}

	#[test]
	fn branch_protocol_mismatch_is_rejected() {
		let cfg = r#"
nodes:
  - name: a
    address: 10.0.0.1:80
clusters:
  - name: web
    protocol: http
    members: ["a"]
  - name: raw
    protocol: tcp
    members: ["a"]
branches:
  - name: b
    cases:
      - attribute: uri
        equals: /x
        goto: web
    fallback: raw
"#;
		let err = normalize(parse(cfg).unwrap()).unwrap_err();
		assert!(format!("{err:#}").contains("mix protocols"), "{err:#}");
	}

	#[test]
	fn cidr_only_for_remote_address() {
		let cfg = r#"
nodes:
  - name: a
    address: 10.0.0.1:80
clusters:
  - name: web
    members: ["a"]
branches:
  - name: b
    cases:
      - attribute: uri
        cidr: 10.0.0.0/8
        goto: web
    fallback: web
"#;
		assert!(normalize(parse(cfg).unwrap()).is_err());
	}

	#[test]
	fn redirect_https_listener_needs_no_pool() {
		let cfg = r#"
listeners:
  - name: plain
    bind: 0.0.0.0:0
    redirect_https: true
"#;
		let norm = normalize(parse(cfg).unwrap()).unwrap();
		match &norm.listeners[0].destination {
			Goto::Response(r) => {
				assert_eq!(r.status, 301);
				assert!(r.redirect_https);
			},
			other => panic!("unexpected destination {other:?}"),
		}
	}
}
