//! Typed container operations.
//!
//! Every exec into a workspace goes through [`ContainerOp`]: callers pass
//! structured arguments, and rendering to a shell script (with quoting and
//! transport encoding) happens in exactly one place. File content crosses
//! the exec channel base64-encoded in both directions so arbitrary bytes
//! and unicode survive it.

use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;

/// Directories never listed or synced (dependency/VCS trees).
pub const EXCLUDED_DIRS: &[&str] = &[
	"node_modules",
	".git",
	"__pycache__",
	".venv",
	"venv",
	"target",
	"dist",
	"build",
	".cache",
];

/// Transient file suffixes (editor swap, partial writes).
pub const TRANSIENT_SUFFIXES: &[&str] = &[".swp", ".swx", ".tmp", ".part", "~", ".atelier-tmp"];

#[derive(Debug, Clone, PartialEq)]
pub enum ContainerOp {
	/// `mkdir -p` for a directory chain.
	MakeDirs { path: String },
	/// Atomic write: decode base64 to a temp file, rename over the
	/// target, make it world-writable.
	WriteFile { path: String, content_b64: String },
	/// Emit the file's bytes base64-encoded on stdout.
	ReadFile { path: String },
	/// `rm -f` / `rm -rf`.
	RemovePath { path: String, recursive: bool },
	/// Remove a directory only if it is empty; always exits 0.
	RemoveDirIfEmpty { path: String },
	/// Recursive file listing under `root`: `size\tmtime\tpath` lines,
	/// paths relative to `root`, exclusions applied.
	ListFiles { root: String },
	/// Recursive directory listing under `root`, one relative path per
	/// line, exclusions applied.
	ListDirs { root: String },
	/// `test -e`; presence is the exit code.
	PathExists { path: String },
	/// Verbatim bootstrap command (toolchain setup from config).
	Raw { script: String },
}

impl ContainerOp {
	pub fn write_file(path: impl Into<String>, content: &str) -> Self {
		Self::WriteFile {
			path: path.into(),
			content_b64: B64.encode(content.as_bytes()),
		}
	}

	/// Render to a `sh -c` script for a docker-compatible exec.
	pub fn render_script(&self) -> String {
		match self {
			Self::MakeDirs { path } => format!("mkdir -p {}", quote(path)),
			Self::WriteFile { path, content_b64 } => {
				let tmp = format!("{path}.atelier-tmp");
				format!(
					"mkdir -p {dir} && printf '%s' {b64} | base64 -d > {tmp} && mv {tmp} {file} && chmod 666 {file}",
					dir = quote(parent_dir(path)),
					b64 = quote(content_b64),
					tmp = quote(&tmp),
					file = quote(path),
				)
			}
			Self::ReadFile { path } => format!("base64 < {}", quote(path)),
			Self::RemovePath { path, recursive } => {
				if *recursive {
					format!("rm -rf {}", quote(path))
				} else {
					format!("rm -f {}", quote(path))
				}
			}
			Self::RemoveDirIfEmpty { path } => {
				format!("rmdir {} 2>/dev/null || true", quote(path))
			}
			// prune is gated on -type d: a plain file named like an
			// excluded directory still gets listed
			Self::ListFiles { root } => format!(
				"find {} -type d {} -prune -o -type f {} -printf '%s\\t%T@\\t%P\\n'",
				quote(root),
				prune_expr(),
				transient_expr(),
			),
			Self::ListDirs { root } => format!(
				"find {} -type d {} -prune -o -type d -printf '%P\\n'",
				quote(root),
				prune_expr(),
			),
			Self::PathExists { path } => format!("test -e {}", quote(path)),
			Self::Raw { script } => script.clone(),
		}
	}
}

fn prune_expr() -> String {
	let names: Vec<String> = EXCLUDED_DIRS
		.iter()
		.map(|d| format!("-name {}", quote(d)))
		.collect();
	format!("\\( {} \\)", names.join(" -o "))
}

fn transient_expr() -> String {
	TRANSIENT_SUFFIXES
		.iter()
		.map(|s| format!("! -name {}", quote(&format!("*{s}"))))
		.chain(std::iter::once(format!("! -name {}", quote(".#*"))))
		.collect::<Vec<_>>()
		.join(" ")
}

fn parent_dir(path: &str) -> &str {
	match path.rfind('/') {
		Some(0) => "/",
		Some(idx) => &path[..idx],
		None => ".",
	}
}

/// POSIX single-quote escaping.
pub fn quote(s: &str) -> String {
	format!("'{}'", s.replace('\'', "'\\''"))
}

/// Exclusion policy for file paths, shared by the docker rendering
/// above and the in-process test runtime. `EXCLUDED_DIRS` only applies
/// to the directory segments: a file merely named `build` or `target`
/// is still listed. The final name is checked for transient suffixes
/// and lock-file prefixes.
pub fn is_excluded_file(rel_path: &str) -> bool {
	let rel = rel_path.trim_matches('/');
	if rel.is_empty() {
		return false;
	}
	let (dirs, name) = match rel.rsplit_once('/') {
		Some((dirs, name)) => (dirs, name),
		None => ("", rel),
	};
	if dirs.split('/').any(|seg| EXCLUDED_DIRS.contains(&seg)) {
		return true;
	}
	if name.starts_with(".#") {
		return true;
	}
	TRANSIENT_SUFFIXES.iter().any(|s| name.ends_with(s))
}

/// Directory-path variant: every segment is a directory name, so the
/// exclusion applies to all of them, the final one included.
pub fn is_excluded_dir(rel_path: &str) -> bool {
	let rel = rel_path.trim_matches('/');
	if rel.is_empty() {
		return false;
	}
	rel.split('/').any(|seg| EXCLUDED_DIRS.contains(&seg))
}

/// Metadata for one listed container file.
#[derive(Debug, Clone, PartialEq)]
pub struct FileMeta {
	pub path: String,
	pub size: u64,
	pub mtime: i64,
}

/// Parse `ListFiles` output (`size\tmtime\tpath` per line).
pub fn parse_file_listing(stdout: &str) -> Vec<FileMeta> {
	stdout
		.lines()
		.filter_map(|line| {
			let mut parts = line.splitn(3, '\t');
			let size = parts.next()?.trim().parse::<u64>().ok()?;
			let mtime = parts.next()?.trim().parse::<f64>().ok()? as i64;
			let path = crate::paths::normalize(parts.next()?);
			if path.is_empty() {
				return None;
			}
			Some(FileMeta { path, size, mtime })
		})
		.collect()
}

/// Parse `ListDirs` output. The root itself prints an empty line; drop it.
pub fn parse_dir_listing(stdout: &str) -> Vec<String> {
	stdout
		.lines()
		.map(crate::paths::normalize)
		.filter(|p| !p.is_empty())
		.collect()
}

/// Decode `ReadFile` stdout back into text. `None` when the payload is
/// not valid base64/UTF-8 (truncated exec, binary file).
pub fn decode_content(stdout: &str) -> Option<String> {
	let compact: String = stdout.chars().filter(|c| !c.is_whitespace()).collect();
	let bytes = B64.decode(compact).ok()?;
	String::from_utf8(bytes).ok()
}

#[cfg(test)]
mod tests {
	use super::*;

	#[test]
	fn quote_escapes_single_quotes() {
		assert_eq!(quote("plain"), "'plain'");
		assert_eq!(quote("it's"), "'it'\\''s'");
	}

	#[test]
	fn write_file_round_trips_unicode() {
		let content = "héllo → wörld\n\t∑ symbols 'quoted' \"too\"";
		let op = ContainerOp::write_file("/workspace/a.txt", content);
		let ContainerOp::WriteFile { content_b64, .. } = &op else {
			panic!("wrong variant");
		};
		assert_eq!(decode_content(content_b64).unwrap(), content);
	}

	#[test]
	fn write_file_script_is_atomic_and_world_writable() {
		let op = ContainerOp::write_file("/workspace/sub/a.txt", "x");
		let script = op.render_script();
		assert!(script.contains("mkdir -p '/workspace/sub'"));
		assert!(script.contains(".atelier-tmp"));
		assert!(script.contains("mv "));
		assert!(script.contains("chmod 666"));
	}

	#[test]
	fn list_files_script_prunes_and_skips_transients() {
		let script = ContainerOp::ListFiles { root: "/workspace".into() }.render_script();
		assert!(script.contains("-name 'node_modules'"));
		assert!(script.contains("-name '.git'"));
		assert!(script.contains("! -name '*.swp'"));
		assert!(script.contains("%s\\t%T@\\t%P"));
		// only directories are pruned
		assert!(script.starts_with("find '/workspace' -type d"));
	}

	#[test]
	fn list_dirs_script_prunes_directories_only() {
		let script = ContainerOp::ListDirs { root: "/workspace".into() }.render_script();
		assert!(script.starts_with("find '/workspace' -type d"));
		assert!(script.contains("-prune -o -type d -printf"));
	}

	#[test]
	fn exclusion_policy_for_files() {
		assert!(is_excluded_file("node_modules/lodash/index.js"));
		assert!(is_excluded_file("src/.git/config"));
		assert!(is_excluded_file("notes.txt~"));
		assert!(is_excluded_file("a/b/.#lock"));
		assert!(is_excluded_file("partial.part"));
		assert!(!is_excluded_file("src/main.rs"));
		assert!(!is_excluded_file("buildings/plan.txt"));
		// files named like excluded directories still sync
		assert!(!is_excluded_file("scripts/build"));
		assert!(!is_excluded_file("target"));
		assert!(!is_excluded_file("dist"));
	}

	#[test]
	fn exclusion_policy_for_dirs() {
		assert!(is_excluded_dir("node_modules"));
		assert!(is_excluded_dir("a/target/debug"));
		assert!(is_excluded_dir("src/.git"));
		assert!(!is_excluded_dir("src"));
		assert!(!is_excluded_dir("buildings"));
	}

	#[test]
	fn parses_file_listing() {
		let out = "12\t1699999999.123\tsrc/main.rs\n0\t1700000000.0\tREADME.md\n\nbad line\n";
		let metas = parse_file_listing(out);
		assert_eq!(metas.len(), 2);
		assert_eq!(metas[0].path, "src/main.rs");
		assert_eq!(metas[0].size, 12);
		assert_eq!(metas[0].mtime, 1699999999);
	}

	#[test]
	fn parses_dir_listing_dropping_root() {
		let dirs = parse_dir_listing("\nsrc\nsrc/bin\n");
		assert_eq!(dirs, vec!["src", "src/bin"]);
	}

	#[test]
	fn decode_rejects_garbage() {
		assert!(decode_content("!!!not base64!!!").is_none());
	}
}
