/*!
# Stage Checkpoints

Persists the [`EnsembleState`] at every stage boundary so that an
interrupted run can pick up after the last completed stage.

Layout under the run's output directory:

```text
<root>/stage_0/atmip.params
<root>/stage_1/atmip.params
...
<root>/stage_final/atmip.params
```

Every `atmip.params` file holds the JSON encoding of a [`StageCheckpoint`]:
the ensemble state paired with the optional snapshot of the stage observer.
*/

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{AtmipError, Result};
use crate::state::EnsembleState;

/// File name of a stage checkpoint inside its stage directory.
pub const PARAMS_FILE: &str = "atmip.params";

/// Directory name of the terminal pass.
pub const FINAL_STAGE: &str = "stage_final";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StageCheckpoint {
    pub state: EnsembleState,
    #[serde(default)]
    pub update: Option<serde_json::Value>,
}

/// Stage directories of one run.
#[derive(Debug, Clone)]
pub struct StageStore {
    root: PathBuf,
}

impl StageStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn stage_dir(&self, stage: usize) -> PathBuf {
        self.root.join(format!("stage_{stage}"))
    }

    pub fn final_dir(&self) -> PathBuf {
        self.root.join(FINAL_STAGE)
    }

    /// Writes `checkpoint` into `dir/atmip.params`, creating `dir`.
    ///
    /// The file is first written next to its destination and then renamed, so
    /// a crash never leaves a truncated checkpoint behind.
    pub fn save_to(&self, dir: &Path, checkpoint: &StageCheckpoint) -> Result<PathBuf> {
        fs::create_dir_all(dir).map_err(|e| AtmipError::storage(dir, e))?;
        let path = dir.join(PARAMS_FILE);
        let tmp = dir.join(format!("{PARAMS_FILE}.tmp"));
        let json = serde_json::to_vec(checkpoint).map_err(|e| AtmipError::storage(&path, e))?;
        fs::write(&tmp, json).map_err(|e| AtmipError::storage(&tmp, e))?;
        fs::rename(&tmp, &path).map_err(|e| AtmipError::storage(&path, e))?;
        Ok(path)
    }

    /// Writes the checkpoint of stage `stage`.
    pub fn save(&self, stage: usize, checkpoint: &StageCheckpoint) -> Result<PathBuf> {
        self.save_to(&self.stage_dir(stage), checkpoint)
    }

    /// Writes the checkpoint of the terminal pass.
    pub fn save_final(&self, checkpoint: &StageCheckpoint) -> Result<PathBuf> {
        self.save_to(&self.final_dir(), checkpoint)
    }

    pub fn load_from(&self, dir: &Path) -> Result<StageCheckpoint> {
        let path = dir.join(PARAMS_FILE);
        let bytes = fs::read(&path).map_err(|e| AtmipError::storage(&path, e))?;
        serde_json::from_slice(&bytes).map_err(|e| AtmipError::storage(&path, e))
    }

    pub fn load(&self, stage: usize) -> Result<StageCheckpoint> {
        self.load_from(&self.stage_dir(stage))
    }

    /// Deletes the directory of `stage`, if any.
    pub fn remove_stage(&self, stage: usize) -> Result<()> {
        let dir = self.stage_dir(stage);
        match fs::remove_dir_all(&dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(AtmipError::storage(dir, e)),
        }
    }

    /**
    State a run resumed at `resume_stage` continues from.

    Loads the checkpoint of stage `resume_stage - 1`, moves its counter to
    `resume_stage` and deletes whatever a previous attempt left in the
    `resume_stage` directory.
    */
    pub fn resume(&self, resume_stage: usize) -> Result<StageCheckpoint> {
        if resume_stage == 0 {
            return Err(AtmipError::Configuration(
                "stage 0 has no predecessor to resume from".into(),
            ));
        }
        let mut checkpoint = self.load(resume_stage - 1)?;
        checkpoint.state = checkpoint.state.at_stage(resume_stage);
        self.remove_stage(resume_stage)?;
        Ok(checkpoint)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::arr2;
    use tempfile::tempdir;

    fn checkpoint(stage: usize) -> StageCheckpoint {
        let mut state = EnsembleState::initial(arr2(&[[0.1, -2.0 / 3.0], [1e-17, 4.5]]), 0.3, 5);
        state.stage = stage;
        state.beta = 0.123_456_789_012_345_67;
        StageCheckpoint {
            state,
            update: Some(serde_json::json!({"n": 3})),
        }
    }

    #[test]
    fn test_save_and_load() {
        let dir = tempdir().unwrap();
        let store = StageStore::new(dir.path());
        let written = store.save(2, &checkpoint(2)).unwrap();
        assert_eq!(written, dir.path().join("stage_2").join(PARAMS_FILE));
        assert!(!dir.path().join("stage_2").join("atmip.params.tmp").exists());

        let back = store.load(2).unwrap();
        assert_eq!(back, checkpoint(2));
    }

    #[test]
    fn test_resume_discards_partial_stage() {
        let dir = tempdir().unwrap();
        let store = StageStore::new(dir.path());
        store.save(3, &checkpoint(3)).unwrap();
        let partial = store.stage_dir(4);
        fs::create_dir_all(&partial).unwrap();
        fs::write(partial.join("chain-0.csv"), "draw\n").unwrap();

        let resumed = store.resume(4).unwrap();
        assert_eq!(resumed.state.stage, 4);
        assert_eq!(resumed.state.beta, checkpoint(3).state.beta);
        assert!(!partial.exists());
    }

    #[test]
    fn test_missing_checkpoint_is_storage_error() {
        let dir = tempdir().unwrap();
        let store = StageStore::new(dir.path());
        assert!(matches!(store.resume(2), Err(AtmipError::Storage { .. })));
        assert!(matches!(
            store.resume(0),
            Err(AtmipError::Configuration(_))
        ));
    }

    #[test]
    fn test_resume_from_state_with_infinite_likelihood() {
        let dir = tempdir().unwrap();
        let store = StageStore::new(dir.path());
        let mut saved = checkpoint(0);
        saved.state.likelihoods[0] = f64::NEG_INFINITY;
        saved.state.lineage_outputs = vec![vec![f64::NEG_INFINITY], vec![-0.25]];
        store.save(0, &saved).unwrap();

        assert_eq!(store.load(0).unwrap(), saved);
        let resumed = store.resume(1).unwrap();
        assert_eq!(resumed.state.stage, 1);
        assert_eq!(resumed.state.likelihoods[0], f64::NEG_INFINITY);
        assert_eq!(resumed.state.previous_outputs(0), &[f64::NEG_INFINITY]);
    }

    #[test]
    fn test_final_dir() {
        let dir = tempdir().unwrap();
        let store = StageStore::new(dir.path());
        store.save_final(&checkpoint(7)).unwrap();
        assert!(dir.path().join("stage_final").join(PARAMS_FILE).exists());
    }
}
