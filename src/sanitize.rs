const CODE_MARKER: &str = "<code>";
const THINK_OPEN: &str = "<think>";
const THINK_CLOSE: &str = "</think>";

/// Strips reasoning delimiters from a model output fragment.
///
/// Fragments carrying a code block are returned untouched.
pub fn sanitize(fragment: &str) -> String {
  if fragment.contains(CODE_MARKER) {
    return fragment.to_string();
  }
  fragment.replace(THINK_OPEN, "").replace(THINK_CLOSE, "")
}
