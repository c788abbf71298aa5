use std::path::{Path, PathBuf};

use notify::event::{ModifyKind, RenameMode};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FsEventKind {
    Add,
    Change,
    Delete,
}

#[derive(Debug, Clone)]
pub struct FsEvent {
    pub path: PathBuf,
    pub kind: FsEventKind,
}

/// Starts the recursive workspace watcher. Events flow into the bounded
/// channel; the returned guard must stay alive for the watch to continue.
/// Watcher errors are logged, never fatal.
pub fn spawn(root: &Path, tx: mpsc::Sender<FsEvent>) -> anyhow::Result<RecommendedWatcher> {
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let Some(kind) = map_kind(&event.kind) else {
                return;
            };
            for path in event.paths {
                // blocking_send applies backpressure on the notify thread
                // rather than dropping events.
                if tx.blocking_send(FsEvent { path, kind }).is_err() {
                    return;
                }
            }
        }
        Err(error) => tracing::warn!(?error, "watch_error"),
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    Ok(watcher)
}

fn map_kind(kind: &EventKind) -> Option<FsEventKind> {
    match kind {
        EventKind::Create(_) => Some(FsEventKind::Add),
        EventKind::Remove(_) => Some(FsEventKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::From)) => Some(FsEventKind::Delete),
        EventKind::Modify(ModifyKind::Name(RenameMode::To)) => Some(FsEventKind::Add),
        EventKind::Modify(ModifyKind::Metadata(_)) => None,
        EventKind::Modify(_) => Some(FsEventKind::Change),
        EventKind::Access(_) => None,
        EventKind::Any | EventKind::Other => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, MetadataKind, RemoveKind};

    #[test]
    fn creation_and_removal_map_to_add_and_delete() {
        assert_eq!(
            map_kind(&EventKind::Create(CreateKind::File)),
            Some(FsEventKind::Add)
        );
        assert_eq!(
            map_kind(&EventKind::Remove(RemoveKind::File)),
            Some(FsEventKind::Delete)
        );
    }

    #[test]
    fn renames_split_into_delete_and_add() {
        assert_eq!(
            map_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::From))),
            Some(FsEventKind::Delete)
        );
        assert_eq!(
            map_kind(&EventKind::Modify(ModifyKind::Name(RenameMode::To))),
            Some(FsEventKind::Add)
        );
    }

    #[test]
    fn content_changes_map_to_change_and_noise_is_dropped() {
        assert_eq!(
            map_kind(&EventKind::Modify(ModifyKind::Data(DataChange::Content))),
            Some(FsEventKind::Change)
        );
        assert_eq!(
            map_kind(&EventKind::Modify(ModifyKind::Metadata(MetadataKind::Any))),
            None
        );
        assert_eq!(map_kind(&EventKind::Any), None);
    }
}
