//! Registry images and tags
//!
//! A tier, image or tag whose lookup fails keeps its cached rows. The kind
//! as a whole fails only when every configured tier is unreachable.

use super::normalize::Malformed;
use super::{KindOutcome, Sweep};
use crate::context::Context;
use crate::models::{DockerImage, DockerTag, EntityKind};
use crate::sources::SourceResult;
use crate::store::{idx, Entity, Store};
use tracing::warn;

fn retain_image_tags(store: &Store, tags: &mut Sweep<'_, DockerTag>, reference: &str) {
    for tag in store.docker_tags().find_by(idx::IMAGE, reference) {
        tags.retain(tag.key());
    }
}

pub async fn reconcile_registry(ctx: &Context) -> SourceResult<KindOutcome> {
    let registry = ctx.sources.registry.as_ref();
    let store = &ctx.store;
    let tiers = registry.tiers();

    let mut images = Sweep::new(store.docker_images(), EntityKind::DockerImage, 0);
    let mut tags = Sweep::new(store.docker_tags(), EntityKind::DockerTag, 0);
    let mut tier_errors = Vec::new();

    for tier in &tiers {
        let names = match registry.list_images(tier).await {
            Ok(names) => names,
            Err(e) => {
                warn!(tier = %tier, error = %e, "Registry tier unavailable, keeping cached images");
                images.warn(format!("tier {}: {}", tier, e));
                for image in store.docker_images().find_by(idx::REPO, tier) {
                    retain_image_tags(store, &mut tags, &image.reference());
                    images.retain(image.key());
                }
                tier_errors.push(e);
                continue;
            }
        };
        images.outcome.fetched += names.len();

        for name in names {
            let image = DockerImage {
                repo: tier.clone(),
                name,
            };
            let reference = image.reference();

            match registry.list_tags(tier, &image.name).await {
                Ok(tag_names) => {
                    tags.outcome.fetched += tag_names.len();
                    for tag in tag_names {
                        match registry.list_labels(tier, &image.name, &tag).await {
                            Ok(labels) => tags.upsert(DockerTag {
                                image: reference.clone(),
                                name: tag,
                                labels,
                            }),
                            Err(e) => tags.malformed(Malformed {
                                key: Some(format!("{}:{}", reference, tag)),
                                reason: e.to_string(),
                            }),
                        }
                    }
                }
                Err(e) => {
                    warn!(image = %reference, error = %e, "Tag listing failed, keeping cached tags");
                    tags.warn(format!("image {}: {}", reference, e));
                    retain_image_tags(store, &mut tags, &reference);
                }
            }

            images.upsert(image);
        }
    }

    if !tiers.is_empty() && tier_errors.len() == tiers.len() {
        if let Some(e) = tier_errors.into_iter().next() {
            return Err(e);
        }
    }

    let mut outcome = images.finish_with(|reference| store.delete_docker_image(reference).is_some());
    outcome.absorb(tags.finish());
    Ok(outcome)
}
