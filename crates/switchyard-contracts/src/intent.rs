/// Decides whether a prompt is asking to edit the stored reference image
/// rather than generate a fresh one.
///
/// The cue is a coarse substring match on "change", kept for wire
/// compatibility with existing agent prompts. It lives behind this named
/// policy function so a real intent classifier can replace it without
/// touching any builder.
pub fn signals_edit_intent(prompt: &str) -> bool {
    prompt.to_lowercase().contains("change")
}
