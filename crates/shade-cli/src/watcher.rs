use std::path::{Path, PathBuf};
use std::sync::mpsc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

/// Watches a single effect file. Editors often replace files instead of
/// writing in place, so the parent directory is watched and events are
/// filtered by file name.
pub fn watch_effect(
    effect: &Path,
) -> Result<(RecommendedWatcher, mpsc::Receiver<PathBuf>), notify::Error> {
    let (tx, rx) = mpsc::channel();
    let file_name = effect.file_name().map(|n| n.to_os_string());
    let dir = match effect.parent() {
        Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut watcher =
        notify::recommended_watcher(move |result: Result<Event, notify::Error>| match result {
            Ok(event) => match event.kind {
                EventKind::Modify(_) | EventKind::Create(_) => {
                    for path in &event.paths {
                        if path.file_name().map(|n| n.to_os_string()) == file_name {
                            tracing::debug!("Effect file changed: {:?}", path);
                            let _ = tx.send(path.clone());
                        }
                    }
                }
                _ => {}
            },
            Err(e) => {
                tracing::error!("File watcher error: {:?}", e);
            }
        })?;

    watcher.watch(&dir, RecursiveMode::NonRecursive)?;
    tracing::info!("Watching {:?} for changes", effect);

    Ok((watcher, rx))
}
