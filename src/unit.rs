//! Source units and the path/platform conventions shared by every component

use crate::fingerprint::Fingerprint;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

/// Path of the root project configuration unit
pub const ROOT_CONFIG_PATH: &str = "tsconfig.json";

/// Path of the configuration unit that overrides options for server platforms
pub const SERVER_CONFIG_PATH: &str = "server/tsconfig.json";

const CONFIG_FILE_NAME: &str = "tsconfig.json";
const DECLARATION_SUFFIX: &str = ".d.ts";
const SOURCE_EXTENSIONS: &[&str] = &[".tsx", ".ts"];

/// Broad class of a target platform
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlatformKind {
    /// Browser targets (`web.browser`, `web.cordova`, ...)
    Web,
    /// Everything else (`os`, `os.linux.x86_64`, ...)
    Server,
}

impl PlatformKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Web => "web",
            Self::Server => "os",
        }
    }

    /// Directory segment that scopes a file to this kind of platform
    fn scope_segment(&self) -> &'static str {
        match self {
            Self::Web => "client",
            Self::Server => "server",
        }
    }
}

/// Target platform tag, e.g. `web.browser` or `os.linux.x86_64`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Platform(String);

impl Platform {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn kind(&self) -> PlatformKind {
        if self.0.starts_with("web") {
            PlatformKind::Web
        } else {
            PlatformKind::Server
        }
    }

    /// Whether a file at `path` may be seen by this platform.
    ///
    /// Files under a `client/` directory belong to web platforms only and files
    /// under a `server/` directory to server platforms only.
    pub fn can_see(&self, path: &str) -> bool {
        match scope_of(path) {
            Some(kind) => kind == self.kind(),
            None => true,
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Platform {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// Platform kind a path is scoped to by its directory segments, if any
pub fn scope_of(path: &str) -> Option<PlatformKind> {
    let mut segments: Vec<&str> = path.split('/').collect();
    segments.pop();
    for segment in segments {
        if segment == PlatformKind::Web.scope_segment() {
            return Some(PlatformKind::Web);
        }
        if segment == PlatformKind::Server.scope_segment() {
            return Some(PlatformKind::Server);
        }
    }
    None
}

/// Free-form per-unit options supplied by the host
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOptions {
    /// Emit without a module wrapper
    #[serde(default)]
    pub bare: bool,
}

/// Capability of a path-and-platform-aware source unit.
///
/// Only the five accessors are required; every naming convention the engine
/// relies on is derived from them.
pub trait SourceInput {
    /// Stable path, unique within a platform partition
    fn path(&self) -> &str;

    fn contents(&self) -> &str;

    /// Owning package, `None` for application code
    fn package_name(&self) -> Option<&str>;

    fn platform(&self) -> &Platform;

    fn options(&self) -> &UnitOptions;

    fn fingerprint(&self) -> Fingerprint {
        Fingerprint::of(self.contents())
    }

    fn basename(&self) -> &str {
        self.path().rsplit('/').next().unwrap_or_else(|| self.path())
    }

    fn is_package_unit(&self) -> bool {
        self.package_name().is_some()
    }

    fn is_declaration(&self) -> bool {
        is_declaration_path(self.basename())
    }

    /// Any `tsconfig.json`, whatever directory it sits in
    fn is_config(&self) -> bool {
        self.basename() == CONFIG_FILE_NAME
    }

    fn is_root_config(&self) -> bool {
        !self.is_package_unit() && self.path() == ROOT_CONFIG_PATH
    }

    fn is_server_config(&self) -> bool {
        !self.is_package_unit() && self.path() == SERVER_CONFIG_PATH
    }

    fn is_bare(&self) -> bool {
        self.options().bare
    }

    /// Path prefixed with the owning package, `foo:bar` becoming `foo_bar/`
    fn package_prefixed_path(&self) -> String {
        match self.package_name() {
            Some(package) => format!("{}/{}", package.replace(':', "_"), self.path()),
            None => self.path().to_string(),
        }
    }

    /// Module name the transform registers the output under
    fn module_name(&self) -> String {
        strip_source_extension(&self.package_prefixed_path()).to_string()
    }

    /// Absolute-looking path handed to the transform
    fn transform_path(&self) -> String {
        format!("/{}", self.package_prefixed_path())
    }

    fn output_path(&self) -> String {
        format!("{}.js", strip_source_extension(self.path()))
    }
}

pub fn is_declaration_path(path: &str) -> bool {
    path.ends_with(DECLARATION_SUFFIX)
}

/// Strip a trailing `.ts` or `.tsx`, leaving other paths untouched
pub fn strip_source_extension(path: &str) -> &str {
    for ext in SOURCE_EXTENSIONS {
        if let Some(stripped) = path.strip_suffix(ext) {
            return stripped;
        }
    }
    path
}

/// One compilable input supplied by the host for the current cycle
#[derive(Debug, Clone)]
pub struct SourceUnit {
    path: String,
    contents: Arc<str>,
    package_name: Option<String>,
    platform: Platform,
    options: UnitOptions,
    fingerprint: Fingerprint,
}

impl SourceUnit {
    pub fn new(
        path: impl Into<String>,
        contents: impl Into<Arc<str>>,
        platform: impl Into<Platform>,
    ) -> Self {
        let contents = contents.into();
        let fingerprint = Fingerprint::of(contents.as_bytes());
        Self {
            path: path.into(),
            contents,
            package_name: None,
            platform: platform.into(),
            options: UnitOptions::default(),
            fingerprint,
        }
    }

    pub fn with_package(mut self, package: impl Into<String>) -> Self {
        self.package_name = Some(package.into());
        self
    }

    pub fn with_options(mut self, options: UnitOptions) -> Self {
        self.options = options;
        self
    }

    pub fn shared_contents(&self) -> Arc<str> {
        Arc::clone(&self.contents)
    }
}

impl SourceInput for SourceUnit {
    fn path(&self) -> &str {
        &self.path
    }

    fn contents(&self) -> &str {
        &self.contents
    }

    fn package_name(&self) -> Option<&str> {
        self.package_name.as_deref()
    }

    fn platform(&self) -> &Platform {
        &self.platform
    }

    fn options(&self) -> &UnitOptions {
        &self.options
    }

    // Computed once at construction
    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_platform_kind() {
        assert_eq!(Platform::new("web.browser").kind(), PlatformKind::Web);
        assert_eq!(Platform::new("web.cordova").kind(), PlatformKind::Web);
        assert_eq!(Platform::new("os").kind(), PlatformKind::Server);
        assert_eq!(Platform::new("os.linux.x86_64").kind(), PlatformKind::Server);
    }

    #[test]
    fn test_scope_of_uses_directories_only() {
        assert_eq!(scope_of("client/app.d.ts"), Some(PlatformKind::Web));
        assert_eq!(scope_of("imports/server/db.d.ts"), Some(PlatformKind::Server));
        assert_eq!(scope_of("typings/lib.d.ts"), None);
        // A file named like a scope directory is not scoped
        assert_eq!(scope_of("server"), None);
    }

    #[test]
    fn test_can_see() {
        let web = Platform::new("web.browser");
        let os = Platform::new("os");
        assert!(web.can_see("client/a.d.ts"));
        assert!(!os.can_see("client/a.d.ts"));
        assert!(os.can_see("server/a.d.ts"));
        assert!(!web.can_see("server/a.d.ts"));
        assert!(web.can_see("shared/a.d.ts"));
    }

    #[test]
    fn test_path_conventions() {
        let unit = SourceUnit::new("lib/foo.ts", "export {}", "os");
        assert_eq!(unit.module_name(), "lib/foo");
        assert_eq!(unit.transform_path(), "/lib/foo.ts");
        assert_eq!(unit.output_path(), "lib/foo.js");
        assert_eq!(unit.basename(), "foo.ts");

        let packaged = SourceUnit::new("main.ts", "", "os").with_package("acme:utils");
        assert_eq!(packaged.package_prefixed_path(), "acme_utils/main.ts");
        assert_eq!(packaged.module_name(), "acme_utils/main");
    }

    #[test]
    fn test_config_detection() {
        let root = SourceUnit::new("tsconfig.json", "{}", "web.browser");
        assert!(root.is_config());
        assert!(root.is_root_config());
        assert!(!root.is_server_config());

        let server = SourceUnit::new("server/tsconfig.json", "{}", "os");
        assert!(server.is_config());
        assert!(server.is_server_config());

        let nested = SourceUnit::new("imports/tsconfig.json", "{}", "os");
        assert!(nested.is_config());
        assert!(!nested.is_root_config());

        let packaged = SourceUnit::new("tsconfig.json", "{}", "os").with_package("acme");
        assert!(packaged.is_config());
        assert!(!packaged.is_root_config());
    }

    #[test]
    fn test_declaration_detection() {
        assert!(SourceUnit::new("typings/node.d.ts", "", "os").is_declaration());
        assert!(!SourceUnit::new("node.ts", "", "os").is_declaration());
    }

    #[test]
    fn test_fingerprint_tracks_contents() {
        let a = SourceUnit::new("a.ts", "x", "os");
        let b = SourceUnit::new("b.ts", "x", "web.browser");
        assert_eq!(a.fingerprint(), b.fingerprint());
        assert_eq!(a.fingerprint(), Fingerprint::of("x"));
    }
}
