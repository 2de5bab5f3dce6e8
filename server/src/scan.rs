//! Filesystem scanner: walks a folder root, filters to supported code
//! files, hashes contents, and slices files into line-bounded chunks for
//! embedding. The extension table is the single source of language labels.

use crate::error::{Error, Result};
use ignore::WalkBuilder;
use rayon::prelude::*;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::warn;

/// Files larger than this are skipped entirely.
pub const MAX_FILE_BYTES: u64 = 10 * 1024 * 1024;

/// Maximum lines per chunk.
pub const CHUNK_LINES: u32 = 200;

// ---------------------------------------------------------------------------
// Ignore set and language table
// ---------------------------------------------------------------------------

const IGNORED_DIRS: &[&str] = &[
    ".git",
    "node_modules",
    "vendor",
    "dist",
    "build",
    ".vscode",
    ".idea",
    "__pycache__",
    ".next",
    "out",
];

/// Directory basenames excluded from walks and watches.
#[must_use]
pub fn is_ignored_dir(name: &str) -> bool {
    IGNORED_DIRS.contains(&name)
}

/// Extension → language label. This table is also the supported-file
/// filter: anything not listed is skipped by the scanner and watcher.
#[must_use]
pub fn language_for(ext: &str) -> Option<&'static str> {
    let lang = match ext {
        "rs" => "rust",
        "go" => "go",
        "py" => "python",
        "js" => "javascript",
        "jsx" => "javascript",
        "mjs" => "javascript",
        "cjs" => "javascript",
        "ts" => "typescript",
        "tsx" => "typescript",
        "java" => "java",
        "kt" => "kotlin",
        "scala" => "scala",
        "c" => "c",
        "h" => "c",
        "cpp" => "cpp",
        "cc" => "cpp",
        "cxx" => "cpp",
        "hpp" => "cpp",
        "cs" => "csharp",
        "rb" => "ruby",
        "php" => "php",
        "swift" => "swift",
        "sh" => "shell",
        "bash" => "shell",
        "zsh" => "shell",
        "sql" => "sql",
        "proto" => "protobuf",
        "toml" => "toml",
        "yaml" => "yaml",
        "yml" => "yaml",
        "json" => "json",
        "md" => "markdown",
        "html" => "html",
        "css" => "css",
        "vue" => "vue",
        "svelte" => "svelte",
        _ => return None,
    };
    Some(lang)
}

/// True when the path's extension is in the supported set.
#[must_use]
pub fn is_code_file(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| language_for(e).is_some())
}

// ---------------------------------------------------------------------------
// Scanned-file records
// ---------------------------------------------------------------------------

/// Metadata for one file discovered during a walk.
#[derive(Debug, Clone)]
pub struct ScannedFile {
    pub abs_path: PathBuf,
    pub relative_path: String,
    pub language: String,
    /// Hex-encoded SHA-256 of the full byte stream.
    pub content_hash: String,
    pub size_bytes: u64,
    pub line_count: u32,
    pub chunk_count: u32,
}

/// Walk result: successfully processed files plus per-file failures.
/// Failures never abort the walk.
#[derive(Debug, Default)]
pub struct ScanOutcome {
    pub files: Vec<ScannedFile>,
    pub failed: Vec<(PathBuf, String)>,
}

// ---------------------------------------------------------------------------
// Walking
// ---------------------------------------------------------------------------

/// Walk `root` and return every supported file with its hash and chunk
/// count. Unreadable directories are logged and skipped; unreadable files
/// land in `ScanOutcome::failed`.
///
/// # Errors
///
/// Returns [`Error::PathUnreachable`] only when the root itself cannot be
/// read.
pub fn scan_root(root: &Path) -> Result<ScanOutcome> {
    fs::metadata(root).map_err(|source| Error::PathUnreachable {
        path: root.to_path_buf(),
        source,
    })?;

    let skip: HashSet<&'static str> = IGNORED_DIRS.iter().copied().collect();
    let candidates: Mutex<Vec<PathBuf>> = Mutex::new(Vec::new());

    WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .threads(rayon::current_num_threads().min(12))
        .filter_entry(move |entry| {
            if entry.file_type().is_some_and(|ft| ft.is_dir()) {
                let name = entry.file_name().to_string_lossy();
                return !skip.contains(name.as_ref());
            }
            true
        })
        .build_parallel()
        .run(|| {
            Box::new(|entry| {
                let entry = match entry {
                    Ok(e) => e,
                    Err(e) => {
                        warn!(error = %e, "Skipping unreadable walk entry");
                        return ignore::WalkState::Continue;
                    }
                };
                if !entry.file_type().is_some_and(|ft| ft.is_file()) {
                    return ignore::WalkState::Continue;
                }
                if !is_code_file(entry.path()) {
                    return ignore::WalkState::Continue;
                }
                candidates.lock().unwrap().push(entry.path().to_path_buf());
                ignore::WalkState::Continue
            })
        });

    let candidates = candidates.into_inner().unwrap();

    // Hash and count lines in parallel; per-file errors are collected,
    // not propagated.
    let processed: Vec<std::result::Result<Option<ScannedFile>, (PathBuf, String)>> = candidates
        .par_iter()
        .map(|abs_path| {
            process_file(root, abs_path).map_err(|e| (abs_path.clone(), e.to_string()))
        })
        .collect();

    let mut outcome = ScanOutcome::default();
    for item in processed {
        match item {
            Ok(Some(f)) => outcome.files.push(f),
            Ok(None) => {} // oversized, silently skipped
            Err(fail) => outcome.failed.push(fail),
        }
    }
    outcome.files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
    Ok(outcome)
}

type ProcessResult = Result<Option<ScannedFile>>;

/// Stat + hash + line-count one file. `Ok(None)` means skipped (too large).
fn process_file(root: &Path, abs_path: &Path) -> ProcessResult {
    let meta = fs::metadata(abs_path).map_err(|source| Error::PathUnreachable {
        path: abs_path.to_path_buf(),
        source,
    })?;
    if meta.len() > MAX_FILE_BYTES {
        return Ok(None);
    }

    let bytes = fs::read(abs_path).map_err(|source| Error::PathUnreachable {
        path: abs_path.to_path_buf(),
        source,
    })?;

    let ext = abs_path.extension().and_then(|e| e.to_str()).unwrap_or("");
    let language = language_for(ext).unwrap_or("text").to_string();
    let line_count = count_lines(&bytes);
    let relative_path = abs_path
        .strip_prefix(root)
        .unwrap_or(abs_path)
        .to_string_lossy()
        .replace('\\', "/");

    Ok(Some(ScannedFile {
        abs_path: abs_path.to_path_buf(),
        relative_path,
        language,
        content_hash: hash_bytes(&bytes),
        size_bytes: meta.len(),
        line_count,
        chunk_count: chunk_count_for(line_count),
    }))
}

/// Scan a single file relative to a folder root (incremental path).
///
/// # Errors
///
/// [`Error::Unsupported`] for non-code files, [`Error::FileTooLarge`] past
/// the size cap, [`Error::PathUnreachable`] on read failure.
pub fn scan_single(root: &Path, abs_path: &Path) -> Result<ScannedFile> {
    if !is_code_file(abs_path) {
        return Err(Error::Unsupported(abs_path.to_path_buf()));
    }
    let meta = fs::metadata(abs_path).map_err(|source| Error::PathUnreachable {
        path: abs_path.to_path_buf(),
        source,
    })?;
    if meta.len() > MAX_FILE_BYTES {
        return Err(Error::FileTooLarge {
            path: abs_path.to_path_buf(),
            size: meta.len(),
        });
    }
    match process_file(root, abs_path)? {
        Some(f) => Ok(f),
        None => Err(Error::FileTooLarge {
            path: abs_path.to_path_buf(),
            size: meta.len(),
        }),
    }
}

// ---------------------------------------------------------------------------
// Hashing and line counting
// ---------------------------------------------------------------------------

fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("{:x}", hasher.finalize())
}

/// SHA-256 of a file's full byte stream, hex-encoded.
///
/// # Errors
///
/// [`Error::PathUnreachable`] when the file cannot be read.
pub fn hash_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path).map_err(|source| Error::PathUnreachable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(hash_bytes(&bytes))
}

/// Recompute the hash and compare against a stored value.
///
/// # Errors
///
/// [`Error::PathUnreachable`] when the file cannot be read.
pub fn is_file_changed(path: &Path, stored_hash: &str) -> Result<bool> {
    Ok(hash_file(path)? != stored_hash)
}

/// Count lines: one per newline, plus one if the file ends with a
/// non-newline byte (a final unterminated line counts as a line). An empty
/// file has zero lines.
#[must_use]
pub fn count_lines(bytes: &[u8]) -> u32 {
    if bytes.is_empty() {
        return 0;
    }
    let newlines = bytes.iter().filter(|&&b| b == b'\n').count() as u32;
    if bytes.ends_with(b"\n") {
        newlines
    } else {
        newlines + 1
    }
}

/// Chunks per file: ⌈lines / 200⌉, minimum 1 (an empty file still gets one
/// empty chunk so its vector point namespace is well-defined).
#[must_use]
pub fn chunk_count_for(line_count: u32) -> u32 {
    line_count.div_ceil(CHUNK_LINES).max(1)
}

// ---------------------------------------------------------------------------
// Chunking
// ---------------------------------------------------------------------------

/// A chunk slice before it is bound to a file record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChunkSlice {
    pub index: u32,
    pub content: String,
    /// 1-based inclusive.
    pub start_line: u32,
    /// 1-based inclusive; `start_line - 1` for the empty-file chunk.
    pub end_line: u32,
}

/// Re-read a file and slice it into sequential chunks of up to 200 lines.
///
/// Line terminators stay inside the chunk text, so concatenating all
/// chunks in index order reproduces the file byte-for-byte. An empty file
/// yields one empty chunk with lines (1, 0).
///
/// # Errors
///
/// [`Error::PathUnreachable`] when the file cannot be read.
pub fn chunk_file(path: &Path) -> Result<Vec<ChunkSlice>> {
    let content = fs::read_to_string(path).map_err(|source| Error::PathUnreachable {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(chunk_content(&content))
}

/// Slice already-loaded content. See [`chunk_file`].
#[must_use]
pub fn chunk_content(content: &str) -> Vec<ChunkSlice> {
    if content.is_empty() {
        return vec![ChunkSlice {
            index: 0,
            content: String::new(),
            start_line: 1,
            end_line: 0,
        }];
    }

    // Split into lines that keep their terminators so coverage is exact.
    let mut lines: Vec<&str> = Vec::new();
    let mut rest = content;
    while let Some(pos) = rest.find('\n') {
        lines.push(&rest[..=pos]);
        rest = &rest[pos + 1..];
    }
    if !rest.is_empty() {
        lines.push(rest);
    }

    let mut chunks = Vec::with_capacity(lines.len().div_ceil(CHUNK_LINES as usize));
    for (i, group) in lines.chunks(CHUNK_LINES as usize).enumerate() {
        let start_line = i as u32 * CHUNK_LINES + 1;
        chunks.push(ChunkSlice {
            index: i as u32,
            content: group.concat(),
            start_line,
            end_line: start_line + group.len() as u32 - 1,
        });
    }
    chunks
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use std::io::Write;

    fn write_file(dir: &Path, rel: &str, content: &str) -> PathBuf {
        let path = dir.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).unwrap();
        }
        let mut f = File::create(&path).unwrap();
        f.write_all(content.as_bytes()).unwrap();
        path
    }

    #[test]
    fn line_counting_rules() {
        assert_eq!(count_lines(b""), 0);
        assert_eq!(count_lines(b"one line no newline"), 1);
        assert_eq!(count_lines(b"one line\n"), 1);
        assert_eq!(count_lines(b"a\nb\nc"), 3);
        assert_eq!(count_lines(b"a\nb\nc\n"), 3);
    }

    #[test]
    fn chunk_counts() {
        assert_eq!(chunk_count_for(0), 1);
        assert_eq!(chunk_count_for(1), 1);
        assert_eq!(chunk_count_for(200), 1);
        assert_eq!(chunk_count_for(201), 2);
        assert_eq!(chunk_count_for(999), 5);
    }

    #[test]
    fn chunk_coverage_is_byte_exact() {
        let cases = [
            String::new(),
            "single".to_string(),
            "trailing newline\n".to_string(),
            (0..450).map(|i| format!("line {i}\n")).collect::<String>(),
            {
                let mut s: String = (0..399).map(|i| format!("l{i}\n")).collect();
                s.push_str("unterminated");
                s
            },
        ];
        for content in &cases {
            let chunks = chunk_content(content);
            let joined: String = chunks.iter().map(|c| c.content.as_str()).collect();
            assert_eq!(&joined, content);
            for (i, c) in chunks.iter().enumerate() {
                assert_eq!(c.index as usize, i);
            }
        }
    }

    #[test]
    fn chunk_line_ranges_are_contiguous() {
        let content: String = (0..450).map(|i| format!("line {i}\n")).collect();
        let chunks = chunk_content(&content);
        assert_eq!(chunks.len(), 3);
        assert_eq!((chunks[0].start_line, chunks[0].end_line), (1, 200));
        assert_eq!((chunks[1].start_line, chunks[1].end_line), (201, 400));
        assert_eq!((chunks[2].start_line, chunks[2].end_line), (401, 450));
    }

    #[test]
    fn empty_file_gets_one_empty_chunk() {
        let chunks = chunk_content("");
        assert_eq!(chunks.len(), 1);
        assert_eq!(chunks[0].start_line, 1);
        assert_eq!(chunks[0].end_line, 0);
        assert!(chunks[0].content.is_empty());
    }

    #[test]
    fn scan_skips_ignored_dirs_and_unsupported_files() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "src/main.rs", "fn main() {}\n");
        write_file(dir.path(), "node_modules/pkg/index.js", "module.exports = 1;\n");
        write_file(dir.path(), "image.png", "not a code file");
        write_file(dir.path(), ".git/config", "[core]\n");

        let outcome = scan_root(dir.path()).unwrap();
        let rels: Vec<&str> = outcome.files.iter().map(|f| f.relative_path.as_str()).collect();
        assert_eq!(rels, vec!["src/main.rs"]);
        assert!(outcome.failed.is_empty());
    }

    #[test]
    fn scan_records_hash_and_language() {
        let dir = tempfile::tempdir().unwrap();
        write_file(dir.path(), "auth.go", "package auth\n");
        let outcome = scan_root(dir.path()).unwrap();
        let f = &outcome.files[0];
        assert_eq!(f.language, "go");
        assert_eq!(f.line_count, 1);
        assert_eq!(f.chunk_count, 1);
        assert_eq!(f.content_hash.len(), 64);
        assert!(!is_file_changed(&f.abs_path, &f.content_hash).unwrap());
    }

    #[test]
    fn changed_file_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "util.go", "package util\n");
        let hash = hash_file(&path).unwrap();
        write_file(dir.path(), "util.go", "package util\n// edited\n");
        assert!(is_file_changed(&path, &hash).unwrap());
    }

    #[test]
    fn scan_single_rejects_unsupported() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_file(dir.path(), "notes.bin", "binary-ish");
        let err = scan_single(dir.path(), &path).unwrap_err();
        assert_eq!(err.code(), "UNSUPPORTED_FILE");
    }
}
