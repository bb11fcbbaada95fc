//! `#proposalData=` repair.
//!
//! Upstream data quirk: some `ProposalCreated` descriptions carry a
//! `#proposalData=` marker followed by raw bytes that are not valid UTF-8.
//! Strict decoding of such a row or log fails. The fallback here is invoked
//! only after that failure: the description is cut at the marker and the
//! prefix kept. It is not a general recovery mechanism.

use tracing::warn;

pub const PROPOSAL_DATA_MARKER: &[u8] = b"#proposalData=";

/// Recover a description from raw bytes that failed UTF-8 decoding.
///
/// Everything from the marker onward is dropped. Without a marker, or if the
/// prefix itself is invalid, invalid sequences are replaced (lossy).
pub fn recover_description(raw: &[u8]) -> String {
    let head = match find(raw, PROPOSAL_DATA_MARKER) {
        Some(pos) => &raw[..pos],
        None => raw,
    };
    match std::str::from_utf8(head) {
        Ok(s) => s.to_string(),
        Err(e) => {
            warn!(error = %e, "description still invalid after marker cut; decoding lossily");
            String::from_utf8_lossy(head).into_owned()
        }
    }
}

/// A description that decoded, but lossily, with the marker tail present.
///
/// Returns the cleaned prefix when the text after the marker contains
/// replacement characters; `None` when the description is untouched.
pub fn strip_marker_tail(description: &str) -> Option<String> {
    let marker = std::str::from_utf8(PROPOSAL_DATA_MARKER).ok()?;
    let pos = description.find(marker)?;
    if description[pos..].contains('\u{FFFD}') {
        Some(description[..pos].to_string())
    } else {
        None
    }
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack.windows(needle.len()).position(|w| w == needle)
}
