//! Component G: the conveyor.
//!
//! Drives a single run over a project's images in dependency order, wiring
//! each stage's predecessor links before handing it to the signature
//! resolver (H) and, unless running signatures-only, the builder (I).

use color_eyre::Result;
use tracing::instrument;

use crate::builder::Builder;
use crate::fingerprint;
use crate::image::Project;
use crate::resolver::{ResolvedStage, Resolver};
use crate::stage::StageArena;

/// Implemented by the action driving a run (`build`, `should-be-built`, …)
/// to short-circuit per-image iteration (§4.G's termination predicate).
pub trait TerminationPredicate {
    fn image_processing_should_be_stopped(&self, image_index: usize) -> bool {
        let _ = image_index;
        false
    }
}

/// The default predicate: never stop early. Used by the plain `build`
/// action, which wants every stage visited regardless of gaps.
pub struct NeverStop;
impl TerminationPredicate for NeverStop {}

pub struct Conveyor<'a> {
    pub project: &'a mut Project,
    pub arena: &'a mut StageArena,
    pub resolver: &'a Resolver,
    pub builder: Option<&'a Builder>,
}

impl<'a> Conveyor<'a> {
    pub fn new(
        project: &'a mut Project,
        arena: &'a mut StageArena,
        resolver: &'a Resolver,
        builder: Option<&'a Builder>,
    ) -> Self {
        Self {
            project,
            arena,
            resolver,
            builder,
        }
    }

    /// Run the conveyor over every image in dependency order. Returns the
    /// indices of images whose iteration was cut short by the termination
    /// predicate.
    #[instrument(skip(self, stop))]
    pub async fn run(&mut self, stop: &impl TerminationPredicate) -> Result<Vec<usize>> {
        let order = self.project.build_order()?;
        let mut stopped = Vec::new();

        for image_index in order {
            let stage_indices = self.project.images[image_index].stages.clone();
            let base_image_id = self.base_image_id(image_index);
            let image_name = self.project.images[image_index].name.clone();

            // `is_empty` is static per stage (§4.F), so the image's terminal
            // non-empty stage is knowable before the loop runs. The builder
            // needs this up front to gate managed-image registration.
            let terminal_stage = stage_indices
                .iter()
                .copied()
                .rev()
                .find(|&index| !self.arena.get(index).is_empty());

            let mut predecessor: Option<usize> = None;
            let mut predecessor_non_empty: Option<usize> = None;
            let mut predecessor_built: Option<usize> = None;

            for (position, stage_index) in stage_indices.iter().copied().enumerate() {
                if stop.image_processing_should_be_stopped(image_index) {
                    stopped.push(image_index);
                    break;
                }

                {
                    let record = self.arena.get_mut(stage_index);
                    record.predecessor = predecessor;
                    record.predecessor_non_empty = predecessor_non_empty;
                    record.predecessor_built = predecessor_built;
                }

                let base_image_id = if position == 0 { base_image_id.as_deref() } else { None };
                let resolved = self
                    .resolver
                    .resolve(self.arena, stage_index, predecessor_non_empty, base_image_id)
                    .await?;

                if let Some(builder) = self.builder {
                    if matches!(resolved, ResolvedStage::MarkedForBuild) {
                        let is_terminal = Some(stage_index) == terminal_stage;
                        builder
                            .build(self.arena, stage_index, predecessor_built, &image_name, is_terminal)
                            .await?;
                    }
                }

                predecessor = Some(stage_index);
                if !self.arena.get(stage_index).is_empty() {
                    predecessor_non_empty = Some(stage_index);
                    if self.arena.get(stage_index).artifact.is_some() {
                        predecessor_built = Some(stage_index);
                    }
                }
            }
        }

        self.finalize_signatures()?;
        Ok(stopped)
    }

    /// The literal base-image reference for an image's `from` stage: either
    /// the configured base image directly, or the parent image's terminal
    /// stages-signature when this image is built `from` another managed
    /// image (set by an earlier iteration, since images are visited in
    /// dependency order).
    fn base_image_id(&self, image_index: usize) -> Option<String> {
        match &self.project.images[image_index].from {
            crate::config::FromRef::BaseImage(id) => Some(id.clone()),
            crate::config::FromRef::Image(name) => self
                .project
                .image_index(name)
                .and_then(|parent| self.project.images[parent].stages_signature.as_ref())
                .map(|fp| fp.to_hex()),
        }
    }

    /// After every image has been visited: record each image's
    /// `last_non_empty_stage` and compute its terminal `stages_signature`
    /// via the fingerprint function seeded with the synthetic name
    /// `imageStages` (§4.G).
    fn finalize_signatures(&mut self) -> Result<()> {
        for image in &mut self.project.images {
            let last_non_empty = image
                .stages
                .iter()
                .copied()
                .rev()
                .find(|&index| !self.arena.get(index).is_empty());

            image.last_non_empty_stage = last_non_empty;

            if let Some(index) = last_non_empty {
                if let Some(terminal_fingerprint) = &self.arena.get(index).fingerprint {
                    image.stages_signature =
                        Some(fingerprint::compute("imageStages", terminal_fingerprint.as_bytes(), None));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FromRef, ShellStageConfig, StageConfig};
    use crate::image::Image;
    use crate::stage::StageRecord;

    fn build_single_image_project() -> (Project, StageArena) {
        let mut arena = StageArena::new();
        let from = arena.push(StageRecord::new(StageConfig::From, 0));
        let install = arena.push(StageRecord::new(
            StageConfig::Install(ShellStageConfig {
                commands: vec!["apk add curl".into()],
                ..Default::default()
            }),
            0,
        ));
        let project = Project {
            name: "demo".into(),
            images: vec![Image::new("app", FromRef::BaseImage("alpine:3".into()), vec![from, install])],
        };
        (project, arena)
    }

    #[test]
    fn single_image_stage_order_is_preserved() {
        let (project, _arena) = build_single_image_project();
        let order = project.build_order().unwrap();
        assert_eq!(order, vec![0]);
    }
}
