//! Process-wide configuration stores.
//!
//! The runtime model is built once at boot from the normalized
//! configuration. The only mutations afterwards are discovery member swaps
//! (inside `Cluster`) and the administratively faded node set, driven by the
//! control plane and persisted to the node-state file.

use std::collections::{BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::RwLockReadGuard;

use crate::cluster::Cluster;
use crate::health::{FailureManager, FailureStatus};
use crate::types::local::NormalizedConfig;
use crate::types::{
	Branch, BranchName, ClusterName, HttpCheckConfig, Listener, MonitorConfig, MonitorName, Node,
	NodeName,
};
use crate::*;

/// Duration of an administrative fade (control plane or node-state file).
pub const ADMIN_FADE_DURATION: Duration = Duration::from_secs(3 * 3600);

pub struct LbState {
	pub listeners: Vec<Arc<Listener>>,
	pub clusters: HashMap<ClusterName, Arc<Cluster>>,
	pub branches: HashMap<BranchName, Arc<Branch>>,
	pub monitors: HashMap<MonitorName, Arc<MonitorConfig>>,
	pub nodes: HashMap<NodeName, Arc<Node>>,
	pub global_http_check: Option<Arc<HttpCheckConfig>>,
}

#[derive(Clone)]
pub struct Stores {
	state: Arc<std::sync::RwLock<LbState>>,
	/// `name:port` entries currently faded by an operator.
	faded: Arc<Mutex<BTreeSet<String>>>,
	state_file: Option<PathBuf>,
}

impl Stores {
	pub fn new(norm: &NormalizedConfig, state_file: Option<PathBuf>) -> Stores {
		let clusters = norm
			.clusters
			.iter()
			.map(|c| (c.name.clone(), Cluster::new(c.clone())))
			.collect();
		let state = LbState {
			listeners: norm.listeners.clone(),
			clusters,
			branches: norm.branches.clone(),
			monitors: norm.monitors.clone(),
			nodes: norm.nodes.clone(),
			global_http_check: norm.global_http_check.clone(),
		};
		Stores {
			state: Arc::new(std::sync::RwLock::new(state)),
			faded: Arc::new(Mutex::new(BTreeSet::new())),
			state_file,
		}
	}

	pub fn read(&self) -> RwLockReadGuard<'_, LbState> {
		self.state.read().expect("store lock poisoned")
	}

	/// Resolves a `name:port` control payload against the configured nodes.
	pub fn find_node_address(&self, payload: &str) -> Option<SocketAddr> {
		let (name, port) = payload.split_once(':')?;
		let port: u16 = port.parse().ok().filter(|p| *p != 0)?;
		let state = self.read();
		let node = state.nodes.get(name)?;
		Some(SocketAddr::new(node.address, port))
	}

	/// Marks a node as administratively faded and persists the state file.
	pub fn fade_node(&self, payload: &str, failures: &FailureManager) -> bool {
		let Some(address) = self.find_node_address(payload) else {
			return false;
		};
		failures.set(address, FailureStatus::Fade, ADMIN_FADE_DURATION);
		self
			.faded
			.lock()
			.expect("faded lock poisoned")
			.insert(payload.to_string());
		self.persist_state();
		true
	}

	/// Clears all failure state of a node and persists the state file.
	pub fn enable_node(&self, payload: &str, failures: &FailureManager) -> bool {
		let Some(address) = self.find_node_address(payload) else {
			return false;
		};
		failures.unset_all(address);
		self
			.faded
			.lock()
			.expect("faded lock poisoned")
			.remove(payload);
		self.persist_state();
		true
	}

	/// Re-reads the node-state file, replacing the faded set.
	pub fn reload_state(&self, failures: &FailureManager) {
		let Some(path) = &self.state_file else {
			return;
		};
		let contents = match std::fs::read_to_string(path) {
			Ok(c) => c,
			Err(e) => {
				warn!("failed to read node state file {path:?}: {e}");
				return;
			},
		};
		let mut previous = {
			let mut faded = self.faded.lock().expect("faded lock poisoned");
			std::mem::take(&mut *faded)
		};
		for line in contents.lines() {
			let line = line.trim();
			if line.is_empty() || line.starts_with('#') {
				continue;
			}
			let Some(address) = self.find_node_address(line) else {
				warn!("node state file references unknown node {line:?}");
				continue;
			};
			failures.set(address, FailureStatus::Fade, ADMIN_FADE_DURATION);
			previous.remove(line);
			self
				.faded
				.lock()
				.expect("faded lock poisoned")
				.insert(line.to_string());
		}
		// Entries no longer present in the file are un-faded.
		for stale in previous {
			if let Some(address) = self.find_node_address(&stale) {
				failures.unset(address, FailureStatus::Fade);
			}
		}
		info!("node state reloaded from {path:?}");
	}

	fn persist_state(&self) {
		let Some(path) = &self.state_file else {
			return;
		};
		let contents = {
			let faded = self.faded.lock().expect("faded lock poisoned");
			faded
				.iter()
				.map(|s| s.as_str())
				.collect::<Vec<_>>()
				.join("\n")
		};
		if let Err(e) = std::fs::write(path, contents + "\n") {
			warn!("failed to write node state file {path:?}: {e}");
		}
	}
}

#[cfg(test)]
mod tests {
	use super::*;
	use crate::types::local;

	fn stores_with_state_file(state_file: Option<PathBuf>) -> Stores {
		let cfg = r#"
nodes:
  - name: web1
    address: 10.9.0.1
clusters:
  - name: web
    members: ["web1:8080"]
"#;
		let norm = local::normalize(local::parse(cfg).unwrap()).unwrap();
		Stores::new(&norm, state_file)
	}

	#[test]
	fn fade_and_enable_node_round_trip() {
		let stores = stores_with_state_file(None);
		let failures = FailureManager::new();
		let addr: SocketAddr = "10.9.0.1:8080".parse().unwrap();

		assert!(stores.fade_node("web1:8080", &failures));
		assert_eq!(
			failures.get(Instant::now(), addr),
			FailureStatus::Fade
		);

		assert!(stores.enable_node("web1:8080", &failures));
		assert_eq!(failures.get(Instant::now(), addr), FailureStatus::Ok);

		assert!(!stores.fade_node("unknown:1", &failures));
		assert!(!stores.fade_node("web1:notaport", &failures));
	}

	#[test]
	fn state_file_reload_applies_and_clears_fades() {
		let dir = std::env::temp_dir().join(format!("tidegate-test-{}", std::process::id()));
		std::fs::create_dir_all(&dir).unwrap();
		let path = dir.join("nodes");
		std::fs::write(&path, "web1:8080\n").unwrap();

		let stores = stores_with_state_file(Some(path.clone()));
		let failures = FailureManager::new();
		let addr: SocketAddr = "10.9.0.1:8080".parse().unwrap();

		stores.reload_state(&failures);
		assert_eq!(failures.get(Instant::now(), addr), FailureStatus::Fade);

		std::fs::write(&path, "\n").unwrap();
		stores.reload_state(&failures);
		assert_eq!(failures.get(Instant::now(), addr), FailureStatus::Ok);

		let _ = std::fs::remove_dir_all(&dir);
	}
}
