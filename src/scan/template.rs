//! Folder-structure templates: map a path, relative to the data directory,
//! to an owner and an experiment/dataset name pair.
//!
//! Covers five layouts: *Username/Dataset*, *Email/Dataset*,
//! *Username/Experiment/Dataset*, *Username/"MyTardis"/Experiment/Dataset*,
//! *User Group/Instrument/Researcher/Dataset*.

use crate::scan::error::ScanError;
use crate::settings::FolderStructure;

/// One decoded path component, pending owner resolution against the server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TemplateMatch {
    pub owner_key: String,
    pub is_group: bool,
    pub experiment_title: String,
    pub dataset_name: String,
}

/// Split `relative_path`'s components (the path of a dataset folder under
/// the data directory, not including the file itself) according to
/// `structure`. Returns `InvalidFolderStructure` when the
/// layout has fewer components than the template requires.
pub fn match_template(structure: FolderStructure, relative_components: &[&str]) -> Result<TemplateMatch, ScanError> {
    use FolderStructure::*;
    match structure {
        UsernameDataset => {
            let [owner, dataset] = require::<2>(relative_components)?;
            Ok(TemplateMatch {
                owner_key: owner.to_string(),
                is_group: false,
                experiment_title: dataset.to_string(),
                dataset_name: dataset.to_string(),
            })
        }
        EmailDataset => {
            let [owner, dataset] = require::<2>(relative_components)?;
            Ok(TemplateMatch {
                owner_key: owner.to_string(),
                is_group: false,
                experiment_title: dataset.to_string(),
                dataset_name: dataset.to_string(),
            })
        }
        UsernameExperimentDataset => {
            let [owner, experiment, dataset] = require::<3>(relative_components)?;
            Ok(TemplateMatch {
                owner_key: owner.to_string(),
                is_group: false,
                experiment_title: experiment.to_string(),
                dataset_name: dataset.to_string(),
            })
        }
        UsernameMyTardisExperimentDataset => {
            let [owner, literal, experiment, dataset] = require::<4>(relative_components)?;
            if !literal.eq_ignore_ascii_case("mytardis") {
                return Err(ScanError::InvalidFolderStructure(format!(
                    "expected literal \"MyTardis\" component, found {:?}",
                    literal
                )));
            }
            Ok(TemplateMatch {
                owner_key: owner.to_string(),
                is_group: false,
                experiment_title: experiment.to_string(),
                dataset_name: dataset.to_string(),
            })
        }
        UserGroupInstrumentResearcherDataset => {
            let [group, _instrument, researcher, dataset] = require::<4>(relative_components)?;
            Ok(TemplateMatch {
                owner_key: group.to_string(),
                is_group: true,
                experiment_title: format!("{}: {}", researcher, dataset),
                dataset_name: dataset.to_string(),
            })
        }
    }
}

fn require<const N: usize>(components: &[&str]) -> Result<[&str; N], ScanError> {
    if components.len() < N {
        return Err(ScanError::InvalidFolderStructure(format!(
            "expected at least {} path components, found {} ({:?})",
            N,
            components.len(),
            components
        )));
    }
    let mut out = [""; N];
    out.copy_from_slice(&components[..N]);
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_dataset_requires_two_components() {
        let m = match_template(FolderStructure::UsernameDataset, &["alice", "Birds"]).unwrap();
        assert_eq!(m.owner_key, "alice");
        assert!(!m.is_group);
        assert_eq!(m.dataset_name, "Birds");
    }

    #[test]
    fn username_dataset_rejects_single_component() {
        let err = match_template(FolderStructure::UsernameDataset, &["alice"]).unwrap_err();
        assert!(err.to_string().contains("InvalidFolderStructure"));
    }

    #[test]
    fn username_mytardis_experiment_dataset_requires_literal_component() {
        let err = match_template(
            FolderStructure::UsernameMyTardisExperimentDataset,
            &["alice", "NotMyTardis", "Exp", "Dataset"],
        )
        .unwrap_err();
        assert!(err.to_string().contains("InvalidFolderStructure"));

        let ok = match_template(
            FolderStructure::UsernameMyTardisExperimentDataset,
            &["alice", "MyTardis", "Exp", "Dataset"],
        )
        .unwrap();
        assert_eq!(ok.experiment_title, "Exp");
    }

    #[test]
    fn user_group_instrument_researcher_dataset_is_group_owned() {
        let m = match_template(
            FolderStructure::UserGroupInstrumentResearcherDataset,
            &["Microscopy Group", "Scope1", "bob", "Run1"],
        )
        .unwrap();
        assert!(m.is_group);
        assert_eq!(m.owner_key, "Microscopy Group");
        assert_eq!(m.dataset_name, "Run1");
    }
}
