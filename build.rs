fn main() {
    println!("cargo:rerun-if-changed=build.rs");

    // Only the `ffmpeg` feature links against the native libraries.
    if std::env::var_os("CARGO_FEATURE_FFMPEG").is_none() {
        return;
    }

    #[cfg(target_os = "windows")]
    {
        use std::path::PathBuf;

        // Copy the FFmpeg DLLs next to the produced binary
        let ffmpeg_bin = PathBuf::from("third_party/ffmpeg/bin");
        let Some(out_dir) = std::env::var_os("OUT_DIR").map(PathBuf::from) else {
            return;
        };
        // OUT_DIR looks like target/debug/build/<crate>/out, walk up to target/debug/
        let Some(target_dir) = out_dir.ancestors().nth(3) else {
            println!("cargo:warning=Cannot resolve target dir from {}", out_dir.display());
            return;
        };

        if ffmpeg_bin.exists() {
            let entries = match std::fs::read_dir(&ffmpeg_bin) {
                Ok(entries) => entries,
                Err(e) => {
                    println!("cargo:warning=Cannot read {}: {}", ffmpeg_bin.display(), e);
                    return;
                }
            };
            for path in entries.flatten().map(|entry| entry.path()) {
                if !is_required_ffmpeg_dll(&path) {
                    continue;
                }
                let Some(file_name) = path.file_name() else {
                    continue;
                };
                let dest = target_dir.join(file_name);
                if !dest.exists() || file_modified(&path) > file_modified(&dest) {
                    match std::fs::copy(&path, &dest) {
                        Ok(_) => println!("cargo:warning=Copied {} to output dir", path.display()),
                        Err(e) => println!(
                            "cargo:warning=Failed to copy {} to {}: {}",
                            path.display(),
                            dest.display(),
                            e
                        ),
                    }
                }
            }
            // Tell rustc where to find the FFmpeg import libraries
            println!("cargo:rustc-link-search=native={}", ffmpeg_bin.display());
        } else {
            println!(
                "cargo:warning=FFmpeg DLLs not found at {}",
                ffmpeg_bin.display()
            );
        }

        println!("cargo:rerun-if-changed=third_party/ffmpeg/bin");
    }
}

#[cfg(target_os = "windows")]
fn file_modified(path: &std::path::Path) -> std::time::SystemTime {
    std::fs::metadata(path)
        .and_then(|m| m.modified())
        .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
}

#[cfg(target_os = "windows")]
fn is_required_ffmpeg_dll(path: &std::path::Path) -> bool {
    const REQUIRED_DLL_PREFIXES: &[&str] = &["avcodec-", "avformat-", "avutil-", "swscale-"];

    let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
        return false;
    };

    let lower = file_name.to_ascii_lowercase();
    lower.ends_with(".dll") && REQUIRED_DLL_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
}
