use std::fmt;
use std::fmt::{Display, Formatter};

const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(serde::Serialize, Clone, Debug, Default)]
pub struct BuildInfo {
	pub version: &'static str,
	pub git_revision: &'static str,
	pub build_profile: &'static str,
}

impl BuildInfo {
	pub fn new() -> Self {
		BuildInfo {
			version: BUILD_VERSION,
			git_revision: option_env!("TIDEGATE_GIT_REVISION").unwrap_or("unknown"),
			build_profile: if cfg!(debug_assertions) {
				"debug"
			} else {
				"release"
			},
		}
	}
}

impl Display for BuildInfo {
	fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
		write!(
			f,
			"version.BuildInfo{{Version:\"{}\", GitRevision:\"{}\", BuildProfile:\"{}\"}}",
			self.version, self.git_revision, self.build_profile
		)
	}
}
