//! Prompt text used by the session handler and the pipeline.

/// System message every new connection starts with.
pub const DEFAULT_SYSTEM_PROMPT: &str =
    "You are a helpful voice assistant. Keep answers conversational and concise.";

/// Appended to the system prompt when an image generator is configured and
/// the session has image directives enabled. Teaches the model the tag
/// syntax the directive scanner looks for.
pub const IMAGEGEN_INSTRUCTIONS: &str = r#"

IMAGE GENERATION:
You can generate images during conversation using the [IMAGE: description] tag.
When the user asks for a selfie, photo, or picture, or when you want to show them something visually, use this tag.

Examples:
- User: "Send me a selfie!" -> Response: "Sure! Here's a selfie for you. [IMAGE: taking a selfie, smiling at camera, casual pose]"
- User: "Show me what you're wearing" -> Response: "Let me show you! [IMAGE: full body shot, standing pose, showing outfit]"
- During conversation you can proactively send images: "The sunset here is beautiful! [IMAGE: looking at sunset, golden hour lighting, scenic background]"

The image will be generated with your character description automatically. Keep the IMAGE tag description focused on the scene, pose, and context."#;

/// System prompt for the auxiliary call that compresses a raw image
/// directive into a short keyword prompt, keeping diffusion-style generators
/// inside their prompt-length sweet spot.
pub const PROMPT_OPTIMIZER_SYSTEM: &str = "You are a concise image prompt optimizer. Convert \
descriptions into short, focused image prompts using comma-separated keywords. Focus on: pose, \
action, clothing, setting, lighting. Maximum 40 words. No full sentences.";

/// Default user text when a turn carries an image but no words.
pub const DEFAULT_IMAGE_QUESTION: &str = "What do you see in this image?";
