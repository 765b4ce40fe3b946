// Staging paths
// Canonical locations of intermediate files shared by every processor

/// Location of a file produced by `node` during `run_id`.
///
/// `<root>/<run-id>/<node-id>/<output>`; the root may be a local directory
/// or an object-storage URL.
pub fn staged_path(root: &str, run_id: &str, node: &str, output: &str) -> String {
    format!("{}/{}", run_dir(root, run_id), node_file(node, output))
}

/// Directory holding every staged file of a run
pub fn run_dir(root: &str, run_id: &str) -> String {
    let root = root.trim_end_matches('/');
    if root.is_empty() {
        format!("/{}", run_id)
    } else {
        format!("{}/{}", root, run_id)
    }
}

/// Location remote runtimes fetch a pipeline-relative source file from
pub fn source_path(root: &str, run_id: &str, file: &str) -> String {
    format!(
        "{}/_sources/{}",
        run_dir(root, run_id),
        file.trim_start_matches("./").trim_start_matches('/')
    )
}

fn node_file(node: &str, output: &str) -> String {
    format!("{}/{}", node, output.trim_start_matches("./").trim_start_matches('/'))
}

/// Run-level directories no node may be named after
pub const RESERVED_DIRS: [&str; 3] = ["_sources", ".work", ".logs"];

/// A single directory name: no separators, not `.` or `..`
pub fn is_path_segment(name: &str) -> bool {
    !name.is_empty() && name != "." && name != ".." && !name.contains(['/', '\\'])
}

/// Relative path that stays below the directory it is joined to
pub fn is_contained(path: &str) -> bool {
    let path = path.trim();
    if path.is_empty() || path.starts_with(['/', '\\']) || path.contains("://") {
        return false;
    }
    // `C:` style prefixes
    if path.as_bytes().get(1) == Some(&b':') {
        return false;
    }
    path.split(['/', '\\']).all(|segment| segment != "..")
}

/// Environment variable name exposing a staged file to a node
pub fn env_key(prefix: &str, file: &str) -> String {
    let mut key = String::with_capacity(prefix.len() + file.len() + 1);
    key.push_str(prefix);
    key.push('_');
    for c in file.chars() {
        if c.is_ascii_alphanumeric() {
            key.push(c.to_ascii_uppercase());
        } else {
            key.push('_');
        }
    }
    key
}
