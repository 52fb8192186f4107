//! Photos and documents.
//!
//! The file is downloaded into the user's media directory, copied into their
//! workspace, and Claude gets a prompt naming it. Caption = instruction.

use std::path::{Path, PathBuf};

use teloxide::{net::Download, prelude::*};

use ctb_core::{
    domain::UserId,
    formatting::human_size,
    media::MediaStore,
    relay::UserRequest,
};

use crate::router::AppState;

use super::{enqueue, RequestContext};

/// Bot API `getFile` refuses anything larger.
const TELEGRAM_MAX_DOWNLOAD_BYTES: u64 = 20 * 1024 * 1024;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(super) enum AttachmentKind {
    Image,
    Document,
}

impl AttachmentKind {
    fn label(self) -> &'static str {
        match self {
            AttachmentKind::Image => "Image",
            AttachmentKind::Document => "Document",
        }
    }

    fn noun(self) -> &'static str {
        match self {
            AttachmentKind::Image => "image",
            AttachmentKind::Document => "document",
        }
    }

    fn default_instruction(self) -> &'static str {
        match self {
            AttachmentKind::Image => "Please look at this image.",
            AttachmentKind::Document => "Please look at this document.",
        }
    }
}

#[derive(Clone, Debug)]
pub(super) struct Attachment {
    kind: AttachmentKind,
    file_id: String,
    unique_id: String,
    file_name: Option<String>,
    size: u64,
    caption: Option<String>,
}

impl Attachment {
    /// The largest photo size, or the document, of `msg`.
    pub(super) fn from_message(msg: &Message) -> Option<Self> {
        let caption = msg.caption().map(|s| s.to_string());
        if let Some(best) = msg.photo().and_then(|sizes| sizes.last()) {
            return Some(Self {
                kind: AttachmentKind::Image,
                file_id: best.file.id.clone(),
                unique_id: best.file.unique_id.clone(),
                file_name: None,
                size: u64::from(best.file.size),
                caption,
            });
        }
        let doc = msg.document()?;
        Some(Self {
            kind: AttachmentKind::Document,
            file_id: doc.file.id.clone(),
            unique_id: doc.file.unique_id.clone(),
            file_name: doc.file_name.clone(),
            size: u64::from(doc.file.size),
            caption,
        })
    }

    /// Local name for the download; `remote_path` is Telegram's file path.
    fn local_name(&self, remote_path: &str) -> String {
        match self.kind {
            AttachmentKind::Image => photo_file_name(&self.unique_id, remote_path),
            AttachmentKind::Document => match &self.file_name {
                Some(name) if !name.trim().is_empty() => name.clone(),
                _ => format!("document_{}{}", self.unique_id, dotted_extension(remote_path)),
            },
        }
    }
}

fn dotted_extension(remote_path: &str) -> String {
    Path::new(remote_path)
        .extension()
        .map(|e| format!(".{}", e.to_string_lossy().to_lowercase()))
        .unwrap_or_default()
}

/// `photo_<unique id>.<ext>`, `jpg` when Telegram's path has no extension.
pub(super) fn photo_file_name(unique_id: &str, remote_path: &str) -> String {
    match dotted_extension(remote_path).as_str() {
        "" => format!("photo_{unique_id}.jpg"),
        ext => format!("photo_{unique_id}{ext}"),
    }
}

/// `<caption or default>\n\n<Image|Document> file: <name>`.
pub(super) fn build_prompt(kind: AttachmentKind, caption: Option<&str>, file_name: &str) -> String {
    let instruction = caption
        .map(str::trim)
        .filter(|c| !c.is_empty())
        .unwrap_or(kind.default_instruction());
    format!("{instruction}\n\n{} file: {file_name}", kind.label())
}

pub(super) async fn handle_attachment(
    bot: Bot,
    state: &AppState,
    ctx: RequestContext,
    attachment: Attachment,
) {
    if attachment.size > TELEGRAM_MAX_DOWNLOAD_BYTES {
        let note = format!(
            "❌ That {} is {}; bots can only download files up to {}.",
            attachment.kind.noun(),
            human_size(attachment.size),
            human_size(TELEGRAM_MAX_DOWNLOAD_BYTES)
        );
        let _ = state.messenger.send_text(ctx.chat_id, &note).await;
        return;
    }
    tracing::info!(
        user_id = ctx.user_id.0,
        kind = attachment.kind.noun(),
        bytes = attachment.size,
        "attachment received"
    );

    let relay = state.relay.clone();
    let workspace = state.cfg.user_workspace(ctx.user_id);
    enqueue(state, ctx, async move {
        let media = relay.media().clone();
        let stored = match download(&bot, &media, ctx.user_id, &attachment).await {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(user_id = ctx.user_id.0, error = %e, "attachment download failed");
                let note = format!("❌ Failed to download the {}: {e}", attachment.kind.noun());
                let _ = relay.messenger().send_text(ctx.chat_id, &note).await;
                return;
            }
        };

        let in_workspace = match media.copy_into_workspace(&stored, &workspace) {
            Ok(path) => path,
            Err(e) => {
                tracing::warn!(user_id = ctx.user_id.0, error = %e, "copy into workspace failed");
                let note = format!("❌ Could not place the {} in your workspace: {e}", attachment.kind.noun());
                let _ = relay.messenger().send_text(ctx.chat_id, &note).await;
                return;
            }
        };
        let name = in_workspace
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        relay
            .handle(UserRequest {
                user_id: ctx.user_id,
                chat_id: ctx.chat_id,
                prompt: build_prompt(attachment.kind, attachment.caption.as_deref(), &name),
            })
            .await;
    })
    .await;
}

async fn download(
    bot: &Bot,
    media: &MediaStore,
    user_id: UserId,
    attachment: &Attachment,
) -> anyhow::Result<PathBuf> {
    let file = bot.get_file(attachment.file_id.clone()).await?;
    let path = media.allocate(user_id, &attachment.local_name(&file.path))?;
    let mut dst = tokio::fs::File::create(&path).await?;
    bot.download_file(&file.path, &mut dst).await?;
    tracing::debug!(path = %path.display(), "attachment saved");
    Ok(path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attachment(kind: AttachmentKind, file_name: Option<&str>) -> Attachment {
        Attachment {
            kind,
            file_id: "file-id".to_string(),
            unique_id: "AQADx".to_string(),
            file_name: file_name.map(str::to_string),
            size: 10,
            caption: None,
        }
    }

    #[test]
    fn photo_names_use_unique_id_and_remote_extension() {
        assert_eq!(photo_file_name("AQADx", "photos/file_12.jpg"), "photo_AQADx.jpg");
        assert_eq!(photo_file_name("AQADx", "photos/file_12.PNG"), "photo_AQADx.png");
        assert_eq!(photo_file_name("AQADx", "photos/file_12"), "photo_AQADx.jpg");
    }

    #[test]
    fn document_names_keep_the_original_name() {
        let a = attachment(AttachmentKind::Document, Some("report.pdf"));
        assert_eq!(a.local_name("documents/file_3.pdf"), "report.pdf");
        let unnamed = attachment(AttachmentKind::Document, None);
        assert_eq!(unnamed.local_name("documents/file_3.csv"), "document_AQADx.csv");
        let photo = attachment(AttachmentKind::Image, None);
        assert_eq!(photo.local_name("photos/file_1.jpg"), "photo_AQADx.jpg");
    }

    #[test]
    fn prompt_uses_caption_or_default_instruction() {
        assert_eq!(
            build_prompt(AttachmentKind::Image, None, "photo_AQADx.jpg"),
            "Please look at this image.\n\nImage file: photo_AQADx.jpg"
        );
        assert_eq!(
            build_prompt(AttachmentKind::Document, Some("  Summarize it  "), "report.pdf"),
            "Summarize it\n\nDocument file: report.pdf"
        );
        assert_eq!(
            build_prompt(AttachmentKind::Document, Some("   "), "data.csv"),
            "Please look at this document.\n\nDocument file: data.csv"
        );
    }

    #[tokio::test]
    async fn oversized_attachment_is_refused_before_download() {
        let tmp = tempfile::tempdir().unwrap();
        let (state, messenger) = super::super::test_support::state(tmp.path());
        let mut big = attachment(AttachmentKind::Document, Some("huge.zip"));
        big.size = 25 * 1024 * 1024;

        handle_attachment(
            Bot::new("1:x"),
            &state,
            super::super::test_support::ctx(),
            big,
        )
        .await;

        assert_eq!(
            messenger.sent(),
            vec!["❌ That document is 25.0 MB; bots can only download files up to 20.0 MB."
                .to_string()]
        );
        assert_eq!(state.queues.pending(super::super::test_support::ctx().user_id), 0);
    }
}
