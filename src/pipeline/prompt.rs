//! Prompt construction, code cleanup and validation, and the sketch
//! template.

use std::path::Path;

use super::GenerationError;
use crate::schema::{Category, RenderConfig};

const CODE_START: &str = "// YOUR CREATIVE CODE GOES HERE";
const CODE_END: &str = "// END OF YOUR CREATIVE CODE";

/// Prompt asking for the creative part of a sketch using `techniques`.
pub fn build_prompt(techniques: &[(String, Category)], render: &RenderConfig) -> String {
    let mut listing = String::new();
    for (id, category) in techniques {
        listing.push_str(&format!("- {} ({})\n", id.replace('_', " "), category));
    }

    format!(
        "Create a seamless looping generative animation combining these techniques:\n\
         {listing}\n\
         The canvas is {size}x{size} with the origin translated to its center and a \
         black background already drawn. The loop is {frames} frames at {fps} fps.\n\n\
         Write only two functions:\n\
         - void initSketch() for one-time setup of your own state\n\
         - void runSketch(float progress) drawing one frame, where progress goes from \
         0.0 to 1.0 over the loop\n\n\
         Rules:\n\
         1. Do NOT define setup() or draw(); the framework provides them\n\
         2. Animate only through progress so the last frame flows into the first\n\
         3. Do not call background(), translate() to re-center, or saveFrame()\n\
         4. Return plain Processing code between the markers:\n\
         {CODE_START}\n\
         {CODE_END}\n",
        listing = listing,
        size = render.canvas_size,
        frames = render.target_frames,
        fps = render.frame_rate,
    )
}

/// Prompt for a retry that feeds back the previous failure.
pub fn feedback_prompt(base: &str, error: &GenerationError, previous: Option<&str>) -> String {
    let guidance = match error.reason {
        crate::schema::FailureReason::CompileError => {
            "Fix the compile error. Check types, declarations and matching braces."
        }
        crate::schema::FailureReason::InvalidOutput => {
            "The code was rejected or drew nothing. Remove any setup/draw definitions \
             and make sure runSketch draws visible shapes."
        }
        _ => "Try a simpler approach with a cleaner structure.",
    };

    format!(
        "{base}\n\
         Previous attempt failed ({reason}): {message}\n\
         Guidance: {guidance}\n\n\
         Previous code for reference:\n{previous}\n",
        base = base,
        reason = error.reason,
        message = error.message.trim(),
        guidance = guidance,
        previous = previous.unwrap_or("(no code was produced)"),
    )
}

/// Strip markdown fences and non-ASCII characters and keep only the code
/// between the creative-code markers when present.
pub fn clean_code(raw: &str) -> String {
    let ascii: String = raw.chars().filter(|c| c.is_ascii()).collect();

    let body = match ascii.split_once(CODE_START) {
        Some((_, rest)) => rest.split(CODE_END).next().unwrap_or(rest),
        None => ascii.as_str(),
    };

    body.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Reject code the template cannot host.
pub fn validate_code(code: &str) -> Result<(), GenerationError> {
    if code.trim().is_empty() {
        return Err(GenerationError::invalid("empty code"));
    }

    for framework in ["void setup(", "void draw(", "void settings("] {
        if squash(code).contains(&squash(framework)) {
            return Err(GenerationError::invalid(format!(
                "code redefines framework function {}",
                framework.trim_start_matches("void ").trim_end_matches('(')
            )));
        }
    }

    if !squash(code).contains("voidrunSketch(") {
        return Err(GenerationError::invalid("code does not define runSketch(float progress)"));
    }

    let mut depth = 0i64;
    for c in code.chars() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth < 0 {
                    return Err(GenerationError::invalid("unbalanced braces"));
                }
            }
            _ => {}
        }
    }
    if depth != 0 {
        return Err(GenerationError::invalid("unbalanced braces"));
    }

    Ok(())
}

fn squash(s: &str) -> String {
    s.chars().filter(|c| !c.is_whitespace()).collect()
}

/// Wrap validated creative code in the rendering framework.
///
/// Frames are written to `frames_dir/frame-####.png`; the sketch exits after
/// `target_frames` frames.
pub fn sketch_template(code: &str, frames_dir: &Path, render: &RenderConfig) -> String {
    let init = if squash(code).contains("voidinitSketch(") {
        ""
    } else {
        "\nvoid initSketch() {}\n"
    };
    let frames_path = frames_dir.to_string_lossy().replace('\\', "/");

    format!(
        "{CODE_START}\n\
         {code}\n\
         {init}\
         {CODE_END}\n\
         \n\
         void setup() {{\n\
         \x20   size({size}, {size});\n\
         \x20   frameRate({fps});\n\
         \x20   smooth();\n\
         \x20   initSketch();\n\
         }}\n\
         \n\
         final int totalFrames = {frames};\n\
         \n\
         void draw() {{\n\
         \x20   try {{\n\
         \x20       background(0);\n\
         \x20       stroke(255);\n\
         \x20       float progress = float((frameCount - 1) % totalFrames) / totalFrames;\n\
         \x20       translate(width/2, height/2);\n\
         \x20       runSketch(progress);\n\
         \x20       saveFrame(\"{frames_path}/frame-####.png\");\n\
         \x20       if (frameCount >= totalFrames) {{\n\
         \x20           exit();\n\
         \x20       }}\n\
         \x20   }} catch (Exception e) {{\n\
         \x20       println(\"Error in draw(): \" + e.toString());\n\
         \x20       exit();\n\
         \x20   }}\n\
         }}\n",
        code = code,
        init = init,
        size = render.canvas_size,
        fps = render.frame_rate,
        frames = render.target_frames,
        frames_path = frames_path,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::FailureReason;

    const GOOD: &str = "void runSketch(float progress) {\n  ellipse(0, 0, 100 * progress, 100);\n}";

    #[test]
    fn test_prompt_lists_techniques() {
        let techniques = vec![
            ("flow_fields".to_string(), Category::Motion),
            ("voronoi_diagrams".to_string(), Category::Geometry),
        ];
        let prompt = build_prompt(&techniques, &RenderConfig::default());
        assert!(prompt.contains("flow fields (motion)"));
        assert!(prompt.contains("voronoi diagrams (geometry)"));
        assert!(prompt.contains("360 frames"));
    }

    #[test]
    fn test_feedback_includes_error() {
        let err = GenerationError::compile("unexpected token: }");
        let prompt = feedback_prompt("base", &err, Some(GOOD));
        assert!(prompt.starts_with("base"));
        assert!(prompt.contains("compile_error"));
        assert!(prompt.contains("unexpected token"));
        assert!(prompt.contains("runSketch"));
    }

    #[test]
    fn test_clean_code_strips_fences_and_markers() {
        let raw = format!("Here you go:\n{}\n```java\n{}\n```\n{}\ntrailing", CODE_START, GOOD, CODE_END);
        assert_eq!(clean_code(&raw), GOOD);
        assert_eq!(clean_code("```\nint x = 1; // caf\u{e9}\n```"), "int x = 1; // caf");
    }

    #[test]
    fn test_validate_code() {
        assert!(validate_code(GOOD).is_ok());

        let cases = [
            "",
            "void setup() { size(10, 10); }\nvoid runSketch(float p) {}",
            "void draw () {}\nvoid runSketch(float p) {}",
            "void runSketch(float p) { if (p > 0) { }",
            "void runSketch(float p) { } }",
            "void other() {}",
        ];
        for case in cases {
            let err = validate_code(case).unwrap_err();
            assert_eq!(err.reason, FailureReason::InvalidOutput, "{}", case);
        }
    }

    #[test]
    fn test_template_wraps_code() {
        let sketch = sketch_template(GOOD, Path::new("/tmp/renders/render_v3"), &RenderConfig::default());
        assert!(sketch.contains(GOOD));
        assert!(sketch.contains("void initSketch() {}"));
        assert!(sketch.contains("size(1080, 1080);"));
        assert!(sketch.contains("final int totalFrames = 360;"));
        assert!(sketch.contains("saveFrame(\"/tmp/renders/render_v3/frame-####.png\");"));
    }
}
