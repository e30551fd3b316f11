//! Builds a small registry (source -> border distortion -> crop -> gamma),
//! installs a synthetic flat-color image, replays a short edit history and
//! runs the pipeline once, printing the published backbuffer's shape.

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use tracing_subscriber::EnvFilter;

use pixelpipe_cache::{Channels, Datatype, ImageBufferDescriptor, PipelineKind};
use pixelpipe_operator::descriptor::{Colorspace, OperationTags};
use pixelpipe_operator::params::ParamsBlob;
use pixelpipe_operator::{OperatorDescriptor, OperatorRegistryBuilder};
use pixelpipe_driver::{History, HistoryItem, Pipeline};
use pixelpipe_test_ops::{BorderDistortOp, CropOp, GammaOp, IdentityOp};

fn descriptor(name: &'static str, tags: OperationTags, default_params: ParamsBlob) -> OperatorDescriptor {
    OperatorDescriptor {
        name,
        colorspace: Colorspace::Rgb,
        tags,
        default_params,
        default_blend_params: ParamsBlob::empty(),
        default_enabled: true,
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let registry = Arc::new(
        OperatorRegistryBuilder::default()
            .register(descriptor("source", OperationTags::empty(), ParamsBlob::empty()), Arc::new(IdentityOp))
            .register(
                descriptor("border", OperationTags::DISTORTS_GEOMETRY, ParamsBlob::empty()),
                Arc::new(BorderDistortOp { border: 2 }),
            )
            .register(
                descriptor(
                    "crop",
                    OperationTags::DISTORTS_GEOMETRY,
                    ParamsBlob::from_serializable(&json!({ "x": 0, "y": 0, "width": 16, "height": 16 }))
                        .context("building default crop params")?,
                ),
                Arc::new(CropOp),
            )
            .register(
                descriptor(
                    "gamma",
                    OperationTags::empty(),
                    ParamsBlob::from_serializable(&json!({ "gamma": 2.2 })).context("building default gamma params")?,
                ),
                Arc::new(GammaOp),
            )
            .create(),
    );

    let pipeline = Pipeline::init(PipelineKind::Preview, registry);

    let width = 20u32;
    let height = 20u32;
    let descriptor = ImageBufferDescriptor::new(width, height, Channels::Rgba, Datatype::Float32);
    let input = vec![0u8; descriptor.total_bytes()];
    pipeline.set_input(input, descriptor);

    let history = History::new(vec![HistoryItem::new(
        "crop",
        ParamsBlob::from_serializable(&json!({ "x": 1, "y": 1, "width": 12, "height": 12 }))?,
        true,
    )]);
    pipeline.change(&history);

    pipeline.run(0, 0, 12, 12, 1.0).context("running pipeline")?;

    let backbuffer = pipeline.last_backbuffer().context("no backbuffer published")?;
    println!(
        "published {}x{} buffer ({} bytes, fingerprint {})",
        backbuffer.descriptor.width,
        backbuffer.descriptor.height,
        backbuffer.buffer.len(),
        backbuffer.fingerprint.0
    );

    Ok(())
}
