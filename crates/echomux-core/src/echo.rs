//! The echo reply transform.
//!
//! The wire contract is deliberately small: every received text frame is
//! answered with a fixed prefix followed by the verbatim received text, one
//! response per frame, on the same connection, in arrival order. The ordering
//! and delivery guarantees live in the server runtime; this module only owns
//! the payload transform.

/// Literal prefix prepended to every echoed frame.
pub const ECHO_PREFIX: &str = "Message received was: ";

/// Build the reply payload for a received text frame.
///
/// The received text is appended verbatim, including for the empty string
/// (which yields the bare prefix).
pub fn echo_reply(text: &str) -> String {
    let mut reply = String::with_capacity(ECHO_PREFIX.len() + text.len());
    reply.push_str(ECHO_PREFIX);
    reply.push_str(text);
    reply
}

#[cfg(test)]
mod tests {
    use proptest::prelude::proptest;

    use super::*;

    #[test]
    fn reply_carries_prefix_and_text() {
        assert_eq!(echo_reply("hello"), "Message received was: hello");
    }

    #[test]
    fn empty_input_yields_bare_prefix() {
        assert_eq!(echo_reply(""), "Message received was: ");
    }

    #[test]
    fn text_is_not_escaped_or_trimmed() {
        assert_eq!(echo_reply("  a\nb  "), "Message received was:   a\nb  ");
        assert_eq!(echo_reply("Message received was: x"), "Message received was: Message received was: x");
    }

    proptest! {
        #[test]
        fn reply_is_prefix_plus_verbatim_text(s in ".*") {
            let reply = echo_reply(&s);
            assert!(reply.starts_with(ECHO_PREFIX));
            // The prefix is pure ASCII, so slicing at its byte length is safe.
            assert_eq!(&reply[ECHO_PREFIX.len()..], s.as_str());
        }
    }
}
