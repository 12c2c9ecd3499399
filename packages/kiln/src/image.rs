//! Images and the project they belong to (§3's data model, the non-stage
//! half of it).

use kiln_registry_client::registry::Fingerprint;

use crate::config::{FromRef, ProjectConfig, StageConfig};
use crate::stage::{StageArena, StageRecord};

/// A named pipeline of stages in declared order, one entry in a project's
/// managed-image set.
#[derive(Clone, Debug)]
pub struct Image {
    pub name: String,
    pub from: FromRef,
    /// Indices into the run's [`crate::stage::StageArena`], in declared
    /// order.
    pub stages: Vec<usize>,
    /// Set after the conveyor finishes iterating this image's stages.
    pub last_non_empty_stage: Option<usize>,
    /// The fingerprint of the terminal stage, used as the image's identity
    /// tag. `None` until the conveyor has processed the image.
    pub stages_signature: Option<Fingerprint>,
}

impl Image {
    pub fn new(name: impl Into<String>, from: FromRef, stages: Vec<usize>) -> Self {
        Self {
            name: name.into(),
            from,
            stages,
            last_non_empty_stage: None,
            stages_signature: None,
        }
    }
}

/// Owns a set of managed images and, via the stage registry, a set of
/// stage artifacts.
#[derive(Clone, Debug)]
pub struct Project {
    pub name: String,
    pub images: Vec<Image>,
}

impl Project {
    pub fn image_index(&self, name: &str) -> Option<usize> {
        self.images.iter().position(|image| image.name == name)
    }

    /// Materialize a declared [`ProjectConfig`] into the run's stage arena
    /// (design note in §9: a flat, index-referenced arena rather than
    /// owning pointers between stages). Every image gets a synthetic
    /// leading `from` stage regardless of whether the config lists one
    /// explicitly (§3: "`from` is the synthetic first stage of every
    /// image").
    pub fn from_config(config: &ProjectConfig) -> (Self, StageArena) {
        let mut arena = StageArena::new();
        let mut images = Vec::with_capacity(config.images.len());

        for (image_index, image_config) in config.images.iter().enumerate() {
            let mut stage_indices = vec![arena.push(StageRecord::new(StageConfig::From, image_index))];
            for stage_config in &image_config.stages {
                if matches!(stage_config, StageConfig::From) {
                    continue;
                }
                stage_indices.push(arena.push(StageRecord::new(stage_config.clone(), image_index)));
            }
            images.push(Image::new(image_config.name.clone(), image_config.from.clone(), stage_indices));
        }

        (Self { name: config.project.clone(), images }, arena)
    }

    /// Topologically order images by their inter-image `from` dependency
    /// (§4.G: "in dependency order defined by inter-image `from`
    /// references"). Returns an error if the references form a cycle.
    pub fn build_order(&self) -> color_eyre::Result<Vec<usize>> {
        let mut order = Vec::with_capacity(self.images.len());
        let mut state = vec![0u8; self.images.len()]; // 0 = unvisited, 1 = visiting, 2 = done

        fn visit(
            index: usize,
            project: &Project,
            state: &mut [u8],
            order: &mut Vec<usize>,
        ) -> color_eyre::Result<()> {
            match state[index] {
                2 => return Ok(()),
                1 => color_eyre::eyre::bail!(
                    "cyclic `from` dependency detected at image {:?}",
                    project.images[index].name
                ),
                _ => {}
            }
            state[index] = 1;
            if let FromRef::Image(parent_name) = &project.images[index].from {
                if let Some(parent) = project.image_index(parent_name) {
                    visit(parent, project, state, order)?;
                }
            }
            state[index] = 2;
            order.push(index);
            Ok(())
        }

        for index in 0..self.images.len() {
            visit(index, self, &mut state, &mut order)?;
        }
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(name: &str, from: FromRef) -> Image {
        Image::new(name, from, vec![])
    }

    #[test]
    fn build_order_respects_from_image_dependency() {
        let project = Project {
            name: "demo".into(),
            images: vec![
                image("app", FromRef::Image("base".into())),
                image("base", FromRef::BaseImage("alpine:3".into())),
            ],
        };
        let order = project.build_order().unwrap();
        let base_pos = order.iter().position(|&i| project.images[i].name == "base").unwrap();
        let app_pos = order.iter().position(|&i| project.images[i].name == "app").unwrap();
        assert!(base_pos < app_pos);
    }

    #[test]
    fn build_order_detects_cycles() {
        let project = Project {
            name: "demo".into(),
            images: vec![
                image("a", FromRef::Image("b".into())),
                image("b", FromRef::Image("a".into())),
            ],
        };
        assert!(project.build_order().is_err());
    }

    #[test]
    fn from_config_synthesizes_a_leading_from_stage() {
        use crate::config::{ImageConfig, ShellStageConfig};

        let config = ProjectConfig {
            project: "demo".into(),
            images: vec![ImageConfig {
                name: "app".into(),
                from: FromRef::BaseImage("alpine:3".into()),
                stages: vec![StageConfig::Install(ShellStageConfig {
                    commands: vec!["apk add curl".into()],
                    ..Default::default()
                })],
            }],
        };

        let (project, arena) = Project::from_config(&config);
        assert_eq!(project.images.len(), 1);
        let stages = &project.images[0].stages;
        assert_eq!(stages.len(), 2);
        assert_eq!(arena.get(stages[0]).name(), "from");
        assert_eq!(arena.get(stages[1]).name(), "install");
    }
}
