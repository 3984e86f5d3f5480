use std::fmt;

/// The fixed top-level path all client-visible paths are sandboxed beneath.
pub const VIRTUAL_ROOT: &str = "/";

/// An absolute path inside the virtual filesystem view. Always begins with
/// the virtual root and never carries a trailing slash (except the root
/// itself).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct VirtualPath(String);

impl VirtualPath {
    pub fn root() -> Self {
        VirtualPath(VIRTUAL_ROOT.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_root(&self) -> bool {
        self.0 == VIRTUAL_ROOT
    }

    /// True when the path is the virtual root itself or one of its immediate
    /// children. Top-level entries are the mount roots; they cannot be
    /// created, renamed or stored to.
    pub fn is_top_level(&self) -> bool {
        self.0.rfind('/') <= VIRTUAL_ROOT.rfind('/')
    }

    /// The final path segment, or the empty string for the root.
    pub fn file_name(&self) -> &str {
        match self.0.rfind('/') {
            Some(index) => &self.0[index + 1..],
            None => &self.0,
        }
    }
}

impl fmt::Display for VirtualPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Resolves a client-supplied path fragment against the current working
/// directory into an absolute virtual path.
///
/// An empty argument yields the working directory unchanged. An argument
/// beginning with `/` is absolute under the virtual root. Anything else is
/// joined onto the working directory with a single separator. Trailing
/// slashes are always stripped, so `/a/b/` and `/a/b` resolve identically.
///
/// Returns `None` for paths containing `.`, `..` or empty segments; every
/// reachable path stays inside the virtual root.
pub fn resolve(cwd: &VirtualPath, arg: &str) -> Option<VirtualPath> {
    if arg.is_empty() {
        return Some(cwd.clone());
    }
    let joined = if let Some(rest) = arg.strip_prefix('/') {
        format!("{VIRTUAL_ROOT}{}", rest.trim_end_matches('/'))
    } else if cwd.is_root() {
        format!("{VIRTUAL_ROOT}{}", arg.trim_end_matches('/'))
    } else {
        format!("{}/{}", cwd.as_str(), arg.trim_end_matches('/'))
    };
    if !sandboxed(&joined) {
        return None;
    }
    Some(VirtualPath(joined))
}

/// A path is sandboxed when every segment is a plain name. `.` and `..`
/// never resolve; they would step outside the virtual view.
fn sandboxed(path: &str) -> bool {
    path == VIRTUAL_ROOT
        || path[1..]
            .split('/')
            .all(|segment| !segment.is_empty() && segment != "." && segment != "..")
}
