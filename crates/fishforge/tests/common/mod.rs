#![allow(dead_code)]

use std::io::{Cursor, Write};
use std::path::Path;

use fishforge::config::ForgeSettings;
use fishforge::fsutil::sha256_bytes_hex;

pub use fishforge::net::testing::FakeHttp;

pub const RELEASE_API: &str = "https://api.test/releases/latest";
pub const TAG_ARCHIVE: &str = "https://src.test/archive/{tag}.zip";
pub const MIRROR: &str = "https://nets.test/{name}";

/// Zip with the given `(path, contents)` entries; paths ending in `/` become directories.
pub fn zip_of(entries: &[(&str, &str)]) -> Vec<u8> {
    let mut w = zip::ZipWriter::new(Cursor::new(Vec::new()));
    for (name, body) in entries {
        if name.ends_with('/') {
            w.add_directory(*name, zip::write::FileOptions::default())
                .expect("add dir");
        } else {
            w.start_file(*name, zip::write::FileOptions::default())
                .expect("start file");
            w.write_all(body.as_bytes()).expect("write entry");
        }
    }
    w.finish().expect("finish zip").into_inner()
}

/// A network file body plus the name whose hash prefix it satisfies.
pub fn network_payload(len: usize) -> (Vec<u8>, String) {
    let body: Vec<u8> = (0..len).map(|i| (i * 7 % 251) as u8).collect();
    let name = format!("nn-{}.nnue", &sha256_bytes_hex(&body)[..12]);
    (body, name)
}

pub fn evaluate_header(net: &str) -> String {
    format!("#pragma once\n#define EvalFileDefaultNameBig \"{net}\"\n")
}

/// Settings isolated under `root`: no host toolchain roots, local cache, fake URLs.
pub fn isolated_settings(root: &Path) -> ForgeSettings {
    let mut s = ForgeSettings::default();
    s.source.release_api_url = RELEASE_API.to_string();
    s.source.tag_archive_url = TAG_ARCHIVE.to_string();
    s.source.cache_dir = Some(root.join("cache"));
    s.assets.mirrors = vec![MIRROR.to_string()];
    s.assets.min_size_bytes = 1024;
    s.toolchain.fallback_roots = Vec::new();
    s.output.allowed_roots = vec![root.to_path_buf()];
    s.output.scratch_parent = Some(root.join("scratch"));
    s.process.reader_grace_ms = 500;
    s.process.kill_grace_ms = 300;
    s.cleanup.backoff_ms = 10;
    s
}

pub fn dir_is_empty(dir: &Path) -> bool {
    match std::fs::read_dir(dir) {
        Ok(mut it) => it.next().is_none(),
        Err(_) => true,
    }
}

/// Gone, or a zombie nobody has reaped yet.
#[cfg(target_os = "linux")]
pub fn is_dead(pid: i32) -> bool {
    match std::fs::read_to_string(format!("/proc/{pid}/stat")) {
        Ok(stat) => stat
            .rsplit_once(')')
            .and_then(|(_, rest)| rest.trim_start().chars().next())
            .is_some_and(|state| state == 'Z' || state == 'X'),
        Err(_) => true,
    }
}

/// Poll `is_dead` for up to `within`.
#[cfg(target_os = "linux")]
pub fn dies_within(pid: i32, within: std::time::Duration) -> bool {
    let deadline = std::time::Instant::now() + within;
    while !is_dead(pid) && std::time::Instant::now() < deadline {
        std::thread::sleep(std::time::Duration::from_millis(50));
    }
    is_dead(pid)
}
