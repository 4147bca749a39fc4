//! Prompt Assembler
//!
//! Pure merge of the instruction preamble, ranked context, the question
//! and an optional image marker into the upstream request turns.

use crate::classify::Subject;
use crate::retrieval::ContextChunk;

/// Fixed instruction preamble sent as the system turn
pub const PREAMBLE: &str = "你是一名法律职业资格考试辅导老师。请依据给出的参考资料，\
用准确、条理清晰的中文回答考生的问题；资料不足时依据通行的法学理论作答，并指出相关法条或考点。";

/// Marker appended when the question comes with an image
pub const IMAGE_MARKER: &str = "[附图：请结合图片内容作答]";

/// Assembled upstream prompt
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct AssembledPrompt {
    /// System turn
    pub system: String,
    /// User turn
    pub user: String,
    /// Image forwarded with the user turn
    pub image_ref: Option<String>,
}

/// Assemble the prompt for one question
///
/// Chunks are included in the order given, which is their rank.
#[must_use]
pub fn assemble(
    question: &str,
    subject: Subject,
    chunks: &[ContextChunk],
    image_ref: Option<&str>,
) -> AssembledPrompt {
    let mut user = format!("科目：{}\n\n", subject.label());

    if !chunks.is_empty() {
        user.push_str("参考资料：\n");
        for (i, chunk) in chunks.iter().enumerate() {
            user.push_str(&format!("[{}] （{}）{}\n", i + 1, chunk.path, chunk.text));
        }
        user.push('\n');
    }

    user.push_str("问题：");
    user.push_str(question);

    if image_ref.is_some() {
        user.push('\n');
        user.push_str(IMAGE_MARKER);
    }

    AssembledPrompt {
        system: PREAMBLE.to_string(),
        user,
        image_ref: image_ref.map(String::from),
    }
}
