//! The binding state file, holding the [`BindingState`] of the last successful cycle as JSON.

use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
};

use snafu::{ResultExt, Snafu};
use stackable_field_patch::engine::BindingState;

#[derive(Debug, Snafu)]
pub enum Error {
    #[snafu(display("failed to read binding state from {path:?}"))]
    ReadState {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to parse binding state from {path:?}"))]
    ParseState {
        source: serde_json::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to serialize binding state"))]
    SerializeState { source: serde_json::Error },

    #[snafu(display("failed to write binding state to {path:?}"))]
    WriteState {
        source: std::io::Error,
        path: PathBuf,
    },

    #[snafu(display("failed to remove binding state {path:?}"))]
    RemoveState {
        source: std::io::Error,
        path: PathBuf,
    },
}

/// Loads the state, `None` if the binding has never been applied.
pub fn load(path: &Path) -> Result<Option<BindingState>, Error> {
    let contents = match std::fs::read(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).context(ReadStateSnafu { path }),
    };
    serde_json::from_slice(&contents)
        .map(Some)
        .context(ParseStateSnafu { path })
}

/// Replaces the state. The new state is written next to the old one first, so that a failed
/// write never leaves a truncated file behind.
pub fn save(path: &Path, state: &BindingState) -> Result<(), Error> {
    let mut contents = serde_json::to_vec_pretty(state).context(SerializeStateSnafu)?;
    contents.push(b'\n');

    let staging = path.with_extension("tmp");
    std::fs::write(&staging, contents).context(WriteStateSnafu { path: &staging })?;
    std::fs::rename(&staging, path).context(WriteStateSnafu { path })
}

/// Forgets the state of a binding whose target is gone.
pub fn remove(path: &Path) -> Result<(), Error> {
    match std::fs::remove_file(path) {
        Err(err) if err.kind() != ErrorKind::NotFound => {
            Err(err).context(RemoveStateSnafu { path })
        }
        _ => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use stackable_field_patch::projection::{Projection, ProjectionState};

    use super::*;

    fn state() -> BindingState {
        BindingState {
            manager_identity: "field-patch.stackable.tech/b1".to_owned(),
            last_projection: ProjectionState::from(Projection::from_iter([("data.k", "v")])),
            last_ownership_snapshot: [(
                "data.k".to_owned(),
                "field-patch.stackable.tech/b1".to_owned(),
            )]
            .into_iter()
            .collect(),
        }
    }

    #[test]
    fn missing_state_is_none() {
        let directory = tempfile::tempdir().expect("temporary directory");
        assert_eq!(
            load(&directory.path().join("state.json")).expect("readable"),
            None
        );
    }

    #[test]
    fn saved_state_is_loaded() {
        let directory = tempfile::tempdir().expect("temporary directory");
        let path = directory.path().join("state.json");

        save(&path, &state()).expect("writable");
        assert_eq!(load(&path).expect("readable"), Some(state()));
        assert!(!path.with_extension("tmp").exists());

        remove(&path).expect("removable");
        assert_eq!(load(&path).expect("readable"), None);
        remove(&path).expect("removing twice is fine");
    }

    #[test]
    fn unknown_projection_is_persisted() {
        let directory = tempfile::tempdir().expect("temporary directory");
        let path = directory.path().join("state.json");
        let state = BindingState {
            last_projection: ProjectionState::Unknown,
            ..state()
        };

        save(&path, &state).expect("writable");
        assert_eq!(load(&path).expect("readable"), Some(state));
    }

    #[test]
    fn corrupt_state_is_an_error() {
        let directory = tempfile::tempdir().expect("temporary directory");
        let path = directory.path().join("state.json");
        std::fs::write(&path, "{\"managerIdentity\": 42}").expect("writable");

        assert!(matches!(load(&path), Err(Error::ParseState { .. })));
    }
}
