//! End-to-end GPU tests for the distance-field pass.
//!
//! Every test acquires its own device and skips (with a note on stderr) when
//! no adapter is available, so the suite stays runnable on GPU-less CI.

use sdfgen::kernel::{kernel_fragment_stage, reference_distance_field};
use sdfgen::pipeline::{CanvasSize, Config};
use sdfgen::value::PixelRecord;
use sdfgen::{GpuContext, InputValue, Pipeline, PipelineError, PixelBuffer, RenderTarget};

fn gpu() -> Option<GpuContext> {
    match GpuContext::new() {
        Ok(gpu) => Some(gpu),
        Err(e) => {
            eprintln!("skipping: {e}");
            None
        }
    }
}

fn float_gpu() -> Option<GpuContext> {
    let gpu = gpu()?;
    if !gpu.supports_float_targets() {
        eprintln!("skipping: adapter cannot render to float targets");
        return None;
    }
    Some(gpu)
}

/// 4x4 all-white field with ink (pure black) texels at the given positions.
fn ink_field(width: u32, height: u32, ink: &[(u32, u32)]) -> Vec<f32> {
    let mut pixels = vec![1.0f32; (width * height * 4) as usize];
    for &(x, y) in ink {
        let offset = ((y * width + x) * 4) as usize;
        pixels[offset] = 0.0;
        pixels[offset + 1] = 0.0;
        pixels[offset + 2] = 0.0;
    }
    pixels
}

fn sdf_config(width: u32, height: u32, spread: u32, float_textures: bool) -> Config {
    Config {
        canvas: CanvasSize { width, height },
        float_textures,
        fragment_shader: Some(kernel_fragment_stage(spread)),
        ..Default::default()
    }
}

fn run_pass(pipeline: &mut Pipeline) -> sdfgen::Readback {
    let (w, h) = pipeline.canvas_size();
    pipeline.set_rectangle(0.0, 0.0, w as f32, h as f32);
    pipeline.draw().unwrap();
    pipeline.readback().unwrap()
}

#[test]
fn distance_field_matches_reference_four_by_four() {
    let Some(gpu) = float_gpu() else { return };
    let spread = 3;
    let input = ink_field(4, 4, &[(0, 0)]);

    let mut pipeline = Pipeline::new(gpu, &sdf_config(4, 4, spread, true)).unwrap();
    pipeline
        .set(
            "u_image",
            InputValue::Pixels(PixelRecord {
                width: Some(4),
                height: Some(4),
                pixels: Some(input.clone()),
            }),
            false,
        )
        .unwrap();

    let readback = run_pass(&mut pipeline);
    let PixelBuffer::Float(out) = readback.pixels else {
        panic!("float pipeline must read back floats");
    };
    let expected = reference_distance_field(&input, 4, 4, spread);
    assert_eq!(out.len(), expected.len());
    for (i, (got, want)) in out.iter().zip(expected.iter()).enumerate() {
        assert!(
            (got - want).abs() < 1e-6,
            "channel {i}: got {got}, want {want}"
        );
    }
}

#[test]
fn byte_mode_quantizes_intensities() {
    let Some(gpu) = gpu() else { return };
    let input = ink_field(4, 4, &[(0, 0)]);

    let mut pipeline = Pipeline::new(gpu, &sdf_config(4, 4, 3, false)).unwrap();
    pipeline
        .set(
            "u_image",
            InputValue::Pixels(PixelRecord {
                width: Some(4),
                height: Some(4),
                pixels: Some(input),
            }),
            false,
        )
        .unwrap();

    let readback = run_pass(&mut pipeline);
    let PixelBuffer::Byte(out) = readback.pixels else {
        panic!("byte pipeline must read back bytes");
    };
    let texel = |x: usize, y: usize| &out[(y * 4 + x) * 4..(y * 4 + x) * 4 + 4];
    // Ink passes through, the adjacent texel is radius 1 of 3, the far
    // corner cliffs to white.
    assert_eq!(texel(0, 0), &[0, 0, 0, 255]);
    assert_eq!(texel(1, 0), &[85, 85, 85, 255]);
    assert_eq!(texel(3, 3), &[255, 255, 255, 255]);
}

#[test]
fn draws_are_deterministic() {
    let Some(gpu) = float_gpu() else { return };
    let input = ink_field(4, 4, &[(2, 1)]);
    let record = PixelRecord {
        width: Some(4),
        height: Some(4),
        pixels: Some(input),
    };

    let mut pipeline = Pipeline::new(gpu, &sdf_config(4, 4, 2, true)).unwrap();
    pipeline
        .set("u_image", InputValue::Pixels(record), false)
        .unwrap();

    let first = run_pass(&mut pipeline);
    let second = run_pass(&mut pipeline);
    match (first.pixels, second.pixels) {
        (PixelBuffer::Float(a), PixelBuffer::Float(b)) => assert_eq!(a, b),
        _ => panic!("float pipeline must read back floats"),
    }
}

#[test]
fn offscreen_texture_target_renders_and_reads_back() {
    let Some(gpu) = gpu() else { return };
    let config = Config {
        canvas: CanvasSize {
            width: 2,
            height: 2,
        },
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(gpu, &config).unwrap();
    // Zero-initialized 4x4 scratch texture doubling as a framebuffer.
    pipeline
        .set(
            "u_scratch",
            InputValue::Pixels(PixelRecord {
                width: Some(4),
                height: Some(4),
                pixels: None,
            }),
            false,
        )
        .unwrap();
    pipeline.rebuild().unwrap();

    pipeline
        .select_render_target(RenderTarget::Input("u_scratch".to_string()))
        .unwrap();
    pipeline.clear([0.0, 0.0, 0.0, 1.0]).unwrap();
    pipeline.set_rectangle(0.0, 0.0, 4.0, 4.0);
    pipeline.draw().unwrap();
    let readback = pipeline.readback().unwrap();
    assert_eq!((readback.width, readback.height), (4, 4));

    // Switching back to the canvas restores its size.
    pipeline.select_render_target(RenderTarget::Canvas).unwrap();
    let readback = pipeline.readback().unwrap();
    assert_eq!((readback.width, readback.height), (2, 2));
}

#[test]
fn new_declarations_require_an_explicit_rebuild() {
    let Some(gpu) = gpu() else { return };
    let config = Config {
        canvas: CanvasSize {
            width: 2,
            height: 2,
        },
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(gpu, &config).unwrap();
    pipeline.set_rectangle(0.0, 0.0, 2.0, 2.0);
    pipeline.draw().unwrap();

    // A fresh declaration makes the program stale until rebuilt.
    let declared = pipeline
        .set("u_threshold", InputValue::Float(0.5), false)
        .unwrap();
    assert!(declared);
    assert!(pipeline.draw().is_err());
    pipeline.rebuild().unwrap();
    pipeline.draw().unwrap();

    // Updating the existing input is not a declaration change.
    let declared = pipeline
        .set("u_threshold", InputValue::Float(0.75), false)
        .unwrap();
    assert!(!declared);
    pipeline.draw().unwrap();
}

#[test]
fn area_readback_crops_and_checks_bounds() {
    let Some(gpu) = float_gpu() else { return };
    let input = ink_field(4, 4, &[(0, 0)]);

    let mut pipeline = Pipeline::new(gpu, &sdf_config(4, 4, 3, true)).unwrap();
    pipeline
        .set(
            "u_image",
            InputValue::Pixels(PixelRecord {
                width: Some(4),
                height: Some(4),
                pixels: Some(input),
            }),
            false,
        )
        .unwrap();

    let full = run_pass(&mut pipeline);
    let area = pipeline.readback_area(1, 1, 2, 2, None).unwrap();
    assert_eq!((area.width, area.height), (2, 2));
    let (PixelBuffer::Float(full), PixelBuffer::Float(area)) = (full.pixels, area.pixels) else {
        panic!("float pipeline must read back floats");
    };
    for row in 0..2usize {
        for col in 0..2usize {
            let src = ((row + 1) * 4 + col + 1) * 4;
            let dst = (row * 2 + col) * 4;
            assert_eq!(&area[dst..dst + 4], &full[src..src + 4]);
        }
    }

    // The named form reads a texture input without switching targets.
    let named = pipeline.readback_area(0, 0, 4, 4, Some("u_image")).unwrap();
    assert_eq!((named.width, named.height), (4, 4));

    assert!(pipeline.readback_area(3, 3, 2, 2, None).is_err());
    assert!(pipeline.readback_area(0, 0, 0, 1, None).is_err());
}

#[test]
fn float_mode_is_refused_without_adapter_support() {
    let Some(gpu) = gpu() else { return };
    if gpu.supports_float_targets() {
        eprintln!("skipping: adapter renders to float targets");
        return;
    }
    // Construction reports the missing capability instead of tripping
    // wgpu's uncaptured-error handler later.
    assert!(matches!(
        Pipeline::new(gpu, &sdf_config(2, 2, 3, true)),
        Err(PipelineError::Gpu(_))
    ));
}

#[test]
fn waiting_on_uniform_inputs_returns_synchronously() {
    let Some(gpu) = gpu() else { return };
    let config = Config {
        canvas: CanvasSize {
            width: 2,
            height: 2,
        },
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(gpu, &config).unwrap();
    pipeline
        .set("u_threshold", InputValue::Float(0.5), false)
        .unwrap();

    // Uniforms have no load step, so the wait must not block on them.
    pipeline.wait_for(vec!["u_threshold".to_string()]).unwrap();
    assert!(matches!(
        pipeline.wait_for(vec!["u_missing".to_string()]),
        Err(PipelineError::InputNotFound(_))
    ));
}

#[test]
fn texture_units_are_stable_and_typed() {
    let Some(gpu) = gpu() else { return };
    let config = Config {
        canvas: CanvasSize {
            width: 2,
            height: 2,
        },
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(gpu, &config).unwrap();
    pipeline
        .set(
            "u_mask",
            InputValue::Pixels(PixelRecord {
                width: Some(1),
                height: Some(1),
                pixels: Some(vec![1.0, 1.0, 1.0, 1.0]),
            }),
            false,
        )
        .unwrap();
    pipeline
        .set("u_gain", InputValue::Float(2.0), false)
        .unwrap();

    // The primary texture owns unit 0, so the first declared texture gets 1,
    // and the unit survives a value update.
    assert_eq!(pipeline.bind_texture("u_mask").unwrap(), 1);
    pipeline
        .set(
            "u_mask",
            InputValue::Pixels(PixelRecord {
                width: Some(1),
                height: Some(1),
                pixels: Some(vec![0.0, 0.0, 0.0, 1.0]),
            }),
            false,
        )
        .unwrap();
    assert_eq!(pipeline.bind_texture("u_mask").unwrap(), 1);

    assert!(matches!(
        pipeline.bind_texture("u_gain"),
        Err(PipelineError::TypeConflict { .. })
    ));
    assert!(matches!(
        pipeline.bind_texture("u_missing"),
        Err(PipelineError::InputNotFound(_))
    ));
}

#[test]
fn same_size_pixel_updates_reach_a_selected_target() {
    let Some(gpu) = gpu() else { return };
    let config = Config {
        canvas: CanvasSize {
            width: 2,
            height: 2,
        },
        ..Default::default()
    };
    let mut pipeline = Pipeline::new(gpu, &config).unwrap();
    let record = |v: f32| PixelRecord {
        width: Some(2),
        height: Some(2),
        pixels: Some(vec![v; 16]),
    };
    pipeline
        .set("u_scratch", InputValue::Pixels(record(0.0)), false)
        .unwrap();
    pipeline
        .select_render_target(RenderTarget::Input("u_scratch".to_string()))
        .unwrap();

    // A same-size re-set updates the texture in place, so the selection
    // made above still sees the new contents.
    pipeline
        .set("u_scratch", InputValue::Pixels(record(1.0)), false)
        .unwrap();
    let readback = pipeline.readback().unwrap();
    let PixelBuffer::Byte(out) = readback.pixels else {
        panic!("byte pipeline must read back bytes");
    };
    assert_eq!(out, vec![255u8; 16]);
}
