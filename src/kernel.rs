//! Distance-field fragment kernel: WGSL generation plus a host-side
//! reference evaluator with identical semantics.
//!
//! Ink is any texel whose r, g and b are exactly zero. A non-ink texel scans
//! expanding midpoint-circle perimeters; the first radius whose perimeter
//! touches ink sets the output intensity to `radius / spread`. Past `spread`
//! the output cliffs to opaque white, with no interpolation. Ink texels pass
//! through unchanged, alpha included.

const KERNEL_BODY: &str = r#"fn is_black(col: vec4f) -> bool {
    return col.r == 0.0 && col.g == 0.0 && col.b == 0.0;
}

// Midpoint circle algorithm, https://en.wikipedia.org/wiki/Midpoint_circle_algorithm
fn ink_on_radius(radius: i32, coords: vec2f, one_pixel: vec2f) -> bool {
    var x: i32 = radius;
    var y: i32 = 0;
    var err: i32 = 0;
    for (var i: i32 = 0; i < 512; i++) {
        if (x >= y) {
            if (is_black(textureSampleLevel(u_image, u_image_sampler, coords + one_pixel * vec2f(f32(x), f32(y)), 0.0))) { return true; }
            if (is_black(textureSampleLevel(u_image, u_image_sampler, coords + one_pixel * vec2f(f32(y), f32(x)), 0.0))) { return true; }
            if (is_black(textureSampleLevel(u_image, u_image_sampler, coords + one_pixel * vec2f(f32(-y), f32(x)), 0.0))) { return true; }
            if (is_black(textureSampleLevel(u_image, u_image_sampler, coords + one_pixel * vec2f(f32(-x), f32(y)), 0.0))) { return true; }
            if (is_black(textureSampleLevel(u_image, u_image_sampler, coords + one_pixel * vec2f(f32(-x), f32(-y)), 0.0))) { return true; }
            if (is_black(textureSampleLevel(u_image, u_image_sampler, coords + one_pixel * vec2f(f32(-y), f32(-x)), 0.0))) { return true; }
            if (is_black(textureSampleLevel(u_image, u_image_sampler, coords + one_pixel * vec2f(f32(y), f32(-x)), 0.0))) { return true; }
            if (is_black(textureSampleLevel(u_image, u_image_sampler, coords + one_pixel * vec2f(f32(x), f32(-y)), 0.0))) { return true; }
            if (err <= 0) {
                y += 1;
                err += 2 * y + 1;
            }
            if (err > 0) {
                x -= 1;
                err -= 2 * x + 1;
            }
        } else {
            break;
        }
    }
    return false;
}

@fragment
fn fs_main(in: VertexOutput) -> @location(0) vec4f {
    let one_pixel = vec2f(1.0, 1.0) / globals.texture_size;
    let ink = textureSampleLevel(u_image, u_image_sampler, in.tex_coord, 0.0);
    if (is_black(ink)) {
        return ink;
    }
    var intensity: f32 = 0.0;
    for (var radius: i32 = 1; radius <= MAX_RADIUS; radius++) {
        if (ink_on_radius(radius, in.tex_coord, one_pixel)) {
            intensity = f32(radius) * SHADE;
            break;
        }
    }
    if (intensity != 0.0) {
        return vec4f(intensity, intensity, intensity, 1.0);
    }
    return vec4f(1.0, 1.0, 1.0, 1.0);
}
"#;

/// Fragment stage of the distance-field kernel, specialized for `spread`.
///
/// The result plugs into [`crate::source::ProgramSource::new`] as the
/// fragment stage; it expects the shared vertex stage's `VertexOutput`.
pub fn kernel_fragment_stage(spread: u32) -> String {
    format!(
        "const MAX_RADIUS: i32 = {spread};\nconst SHADE: f32 = 1.0 / {spread}.0;\n\n{KERNEL_BODY}"
    )
}

fn is_black(px: &[f32]) -> bool {
    px[0] == 0.0 && px[1] == 0.0 && px[2] == 0.0
}

/// Nearest-sample lookup with clamp-to-edge addressing, matching the
/// kernel's sampler.
fn sample<'a>(pixels: &'a [f32], width: u32, height: u32, x: i64, y: i64) -> &'a [f32] {
    let x = x.clamp(0, width as i64 - 1) as usize;
    let y = y.clamp(0, height as i64 - 1) as usize;
    let offset = (y * width as usize + x) * 4;
    &pixels[offset..offset + 4]
}

fn ink_on_radius(pixels: &[f32], width: u32, height: u32, cx: i64, cy: i64, radius: i64) -> bool {
    let mut x = radius;
    let mut y = 0i64;
    let mut err = 0i64;
    for _ in 0..512 {
        if x < y {
            break;
        }
        let mirrors = [
            (x, y),
            (y, x),
            (-y, x),
            (-x, y),
            (-x, -y),
            (-y, -x),
            (y, -x),
            (x, -y),
        ];
        for (dx, dy) in mirrors {
            if is_black(sample(pixels, width, height, cx + dx, cy + dy)) {
                return true;
            }
        }
        if err <= 0 {
            y += 1;
            err += 2 * y + 1;
        }
        if err > 0 {
            x -= 1;
            err -= 2 * x + 1;
        }
    }
    false
}

/// CPU evaluation of the kernel over an RGBA f32 buffer, texel for texel
/// identical to the GPU pass.
pub fn reference_distance_field(pixels: &[f32], width: u32, height: u32, spread: u32) -> Vec<f32> {
    let shade = 1.0f32 / spread as f32;
    let mut out = Vec::with_capacity(pixels.len());
    for cy in 0..height as i64 {
        for cx in 0..width as i64 {
            let px = sample(pixels, width, height, cx, cy);
            if is_black(px) {
                out.extend_from_slice(px);
                continue;
            }
            let mut intensity = 0.0f32;
            for radius in 1..=spread as i64 {
                if ink_on_radius(pixels, width, height, cx, cy, radius) {
                    intensity = radius as f32 * shade;
                    break;
                }
            }
            if intensity != 0.0 {
                out.extend_from_slice(&[intensity, intensity, intensity, 1.0]);
            } else {
                out.extend_from_slice(&[1.0, 1.0, 1.0, 1.0]);
            }
        }
    }
    out
}
