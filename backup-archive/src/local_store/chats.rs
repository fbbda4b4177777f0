// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Threads and their messages.

use rusqlite::{Connection, params};
use tracing::debug;

use super::{fetch_all, from_sql_int, to_sql_int};
use crate::{
    archiver::{ArchiveMultiFrameResult, FrameArchiver, FrameSink, RestoreFrameResult, write_frame},
    context::{ArchivingContext, ChatId, PostFrameRestoreAction, RecipientId, RestoringContext},
    frame_error::{
        ArchiveFrameError, ArchiveFrameErrorKind, FatalArchivingError, InvalidProtoDataError,
        LoggableId, RestoreFrameError, RestoreFrameErrorKind, UnrecognizedEnumError,
    },
    proto::{
        Chat, ChatItem, Direction, FilePointer, Frame, MessageAttachment, StandardMessage, Text,
        ViewOnceMessage, chat_item, frame,
    },
};

// ----------------------------------------------------------------------------
// Chats
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteChats;

impl FrameArchiver<Chat> for SqliteChats {
    fn archive(&self, sink: &mut dyn FrameSink, ctx: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
        let rows = match fetch_all(
            ctx.conn,
            "threads",
            "SELECT id, recipient_id, archived, pinned_order, expiration_timer_ms, mute_until_ms,
                    mark_unread
             FROM thread ORDER BY id",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    Chat {
                        id: 0,
                        recipient_id: 0,
                        archived: row.get(2)?,
                        pinned_order: row.get(3)?,
                        expiration_timer_ms: from_sql_int(row.get(4)?),
                        mute_until_ms: row.get::<_, Option<i64>>(5)?.map(from_sql_int),
                        mark_unread: row.get(6)?,
                    },
                ))
            },
        ) {
            Ok(rows) => rows,
            Err(fatal) => return ArchiveMultiFrameResult::CompleteFailure(fatal),
        };

        let mut errors = Vec::new();
        for (thread_row, recipient_row, mut chat) in rows {
            let Some(recipient) = ctx.recipient_id(recipient_row) else {
                errors.push(ArchiveFrameError::new(
                    ArchiveFrameErrorKind::ReferencedRecipientMissing(recipient_row),
                    LoggableId::local_row("thread", thread_row),
                ));
                continue;
            };
            let chat_id = ctx.assign_chat_id(thread_row);
            chat.id = chat_id.0;
            chat.recipient_id = recipient.0;
            if let Err(e) = write_frame(sink, &Frame::new(frame::Item::Chat(chat)), || {
                LoggableId::chat(chat_id.0)
            }) {
                errors.push(e);
            }
        }
        ArchiveMultiFrameResult::from_errors(errors)
    }

    fn restore(&self, proto: &Chat, ctx: &RestoringContext<'_>) -> RestoreFrameResult<()> {
        let loggable = || LoggableId::chat(proto.id);
        let Some(recipient) = ctx.recipient(RecipientId(proto.recipient_id)) else {
            return RestoreFrameResult::failure(RestoreFrameError::invalid(
                InvalidProtoDataError::RecipientIdNotFound(proto.recipient_id),
                loggable(),
            ));
        };
        let result = ctx.conn.query_row(
            "INSERT INTO thread (recipient_id, archived, pinned_order, expiration_timer_ms,
                 mute_until_ms, mark_unread)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT (recipient_id) DO UPDATE SET
                 archived = excluded.archived,
                 pinned_order = excluded.pinned_order,
                 expiration_timer_ms = excluded.expiration_timer_ms,
                 mute_until_ms = excluded.mute_until_ms,
                 mark_unread = excluded.mark_unread
             RETURNING id",
            params![
                recipient.row_id,
                proto.archived,
                proto.pinned_order,
                to_sql_int(proto.expiration_timer_ms),
                proto.mute_until_ms.map(to_sql_int),
                proto.mark_unread,
            ],
            |row| row.get::<_, i64>(0),
        );
        match result {
            Ok(thread_row) => {
                ctx.map_chat(ChatId(proto.id), thread_row);
                RestoreFrameResult::Success(())
            }
            Err(e) => RestoreFrameResult::failure(RestoreFrameError::database(&e, loggable())),
        }
    }
}

// ----------------------------------------------------------------------------
// Chat items
// ----------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteChatItems;

struct MessageRow {
    row_id: i64,
    thread_row: i64,
    author_row: i64,
    sent_at_ms: u64,
    direction: i32,
    body: Option<String>,
    expires_in_ms: Option<u64>,
    expire_start_ms: Option<u64>,
    view_once: bool,
    viewed: bool,
}

fn message_attachments(
    conn: &Connection,
    message_row: i64,
) -> Result<Vec<MessageAttachment>, FatalArchivingError> {
    fetch_all(
        conn,
        "message attachments",
        "SELECT a.media_name, a.size, a.content_type, a.digest, a.downloaded
         FROM message_attachment ma JOIN attachment a ON a.id = ma.attachment_id
         WHERE ma.message_id = ?1 ORDER BY ma.position",
        [message_row],
        |row| {
            Ok(MessageAttachment {
                pointer: Some(FilePointer {
                    media_name: row.get(0)?,
                    size: from_sql_int(row.get(1)?),
                    content_type: row.get(2)?,
                    digest: row.get(3)?,
                }),
                was_downloaded: row.get(4)?,
            })
        },
    )
}

fn count_attachments(ctx: &ArchivingContext<'_>, attachments: &[MessageAttachment]) {
    for attachment in attachments {
        if let Some(pointer) = &attachment.pointer {
            ctx.byte_counter.add_attachment(&pointer.media_name, pointer.size);
        }
    }
}

impl FrameArchiver<ChatItem> for SqliteChatItems {
    fn archive(&self, sink: &mut dyn FrameSink, ctx: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
        let rows = match fetch_all(
            ctx.conn,
            "messages",
            "SELECT id, thread_id, author_id, sent_at_ms, direction, body, expires_in_ms,
                    expire_start_ms, view_once, viewed
             FROM message ORDER BY id",
            [],
            |row| {
                Ok(MessageRow {
                    row_id: row.get(0)?,
                    thread_row: row.get(1)?,
                    author_row: row.get(2)?,
                    sent_at_ms: from_sql_int(row.get(3)?),
                    direction: row.get(4)?,
                    body: row.get(5)?,
                    expires_in_ms: row.get::<_, Option<i64>>(6)?.map(from_sql_int),
                    expire_start_ms: row.get::<_, Option<i64>>(7)?.map(from_sql_int),
                    view_once: row.get(8)?,
                    viewed: row.get(9)?,
                })
            },
        ) {
            Ok(rows) => rows,
            Err(fatal) => return ArchiveMultiFrameResult::CompleteFailure(fatal),
        };

        let mut errors = Vec::new();
        let mut filtered = 0usize;
        for row in rows {
            if !ctx.filter.should_include_message(
                row.expires_in_ms,
                row.expire_start_ms,
                ctx.start_timestamp_ms,
            ) {
                filtered += 1;
                continue;
            }
            let local_id = || LoggableId::local_row("message", row.row_id);
            let Some(chat_id) = ctx.chat_id(row.thread_row) else {
                errors.push(ArchiveFrameError::new(
                    ArchiveFrameErrorKind::ReferencedChatMissing(row.thread_row),
                    local_id(),
                ));
                continue;
            };
            let Some(author) = ctx.recipient_id(row.author_row) else {
                errors.push(ArchiveFrameError::new(
                    ArchiveFrameErrorKind::ReferencedRecipientMissing(row.author_row),
                    local_id(),
                ));
                continue;
            };
            let attachments = match message_attachments(ctx.conn, row.row_id) {
                Ok(found) => found,
                Err(fatal) => return ArchiveMultiFrameResult::CompleteFailure(fatal),
            };

            let item = if row.view_once {
                let attachment = if ctx.filter.should_tombstone_view_once(row.viewed) {
                    None
                } else {
                    attachments.into_iter().next()
                };
                count_attachments(ctx, attachment.as_slice());
                chat_item::Item::ViewOnceMessage(ViewOnceMessage { attachment })
            } else {
                count_attachments(ctx, &attachments);
                chat_item::Item::StandardMessage(StandardMessage {
                    text: row.body.map(|body| Text { body }),
                    attachments,
                })
            };
            let proto = ChatItem {
                chat_id: chat_id.0,
                author_id: author.0,
                date_sent: row.sent_at_ms,
                expire_start_date: row.expire_start_ms,
                expires_in_ms: row.expires_in_ms,
                direction: row.direction,
                item: Some(item),
            };
            if let Err(e) = write_frame(sink, &Frame::new(frame::Item::ChatItem(proto)), || {
                LoggableId::chat_item(chat_id.0, row.sent_at_ms)
            }) {
                errors.push(e);
            }
        }
        if filtered > 0 {
            debug!(filtered, purpose = %ctx.purpose, "messages left out by content filter");
        }
        ArchiveMultiFrameResult::from_errors(errors)
    }

    fn restore(&self, proto: &ChatItem, ctx: &RestoringContext<'_>) -> RestoreFrameResult<()> {
        let loggable = || LoggableId::chat_item(proto.chat_id, proto.date_sent);
        let invalid = |error| RestoreFrameResult::failure(RestoreFrameError::invalid(error, loggable()));

        let Some(thread_row) = ctx.chat(ChatId(proto.chat_id)) else {
            return invalid(InvalidProtoDataError::ChatIdNotFound(proto.chat_id));
        };
        let Some(author) = ctx.recipient(RecipientId(proto.author_id)) else {
            return invalid(InvalidProtoDataError::RecipientIdNotFound(proto.author_id));
        };
        if proto.date_sent == 0 {
            return invalid(InvalidProtoDataError::ChatItemInvalidDateSent);
        }
        let direction = match Direction::try_from(proto.direction) {
            Ok(direction) if direction != Direction::Unknown => direction,
            _ => {
                return RestoreFrameResult::UnrecognizedEnum(UnrecognizedEnumError::new(
                    "ChatItem.Direction",
                    proto.direction,
                    loggable(),
                ));
            }
        };
        let (body, attachments, view_once): (Option<&str>, Vec<&MessageAttachment>, bool) =
            match &proto.item {
                Some(chat_item::Item::StandardMessage(message)) => {
                    if message.text.is_none() && message.attachments.is_empty() {
                        return invalid(InvalidProtoDataError::EmptyStandardMessage);
                    }
                    (
                        message.text.as_ref().map(|text| text.body.as_str()),
                        message.attachments.iter().collect(),
                        false,
                    )
                }
                Some(chat_item::Item::ViewOnceMessage(message)) => {
                    (None, message.attachment.iter().collect(), true)
                }
                None => return invalid(InvalidProtoDataError::ChatItemMissingItem),
            };
        // a tombstoned view-once message has nothing left to view
        let viewed = view_once && attachments.is_empty();

        let message_row = match ctx.conn.query_row(
            "INSERT INTO message (thread_id, author_id, sent_at_ms, direction, body, expires_in_ms,
                 expire_start_ms, view_once, viewed)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
             ON CONFLICT (thread_id, author_id, sent_at_ms) DO UPDATE SET
                 direction = excluded.direction,
                 body = excluded.body,
                 expires_in_ms = excluded.expires_in_ms,
                 expire_start_ms = excluded.expire_start_ms,
                 view_once = excluded.view_once,
                 viewed = excluded.viewed
             RETURNING id",
            params![
                thread_row,
                author.row_id,
                to_sql_int(proto.date_sent),
                i32::from(direction),
                body,
                proto.expires_in_ms.map(to_sql_int),
                proto.expire_start_date.map(to_sql_int),
                view_once,
                viewed,
            ],
            |row| row.get::<_, i64>(0),
        ) {
            Ok(row_id) => row_id,
            Err(e) => return RestoreFrameResult::failure(RestoreFrameError::database(&e, loggable())),
        };

        let mut partial = Vec::new();
        for (position, attachment) in attachments.into_iter().enumerate() {
            let Some(pointer) = attachment.pointer.as_ref().filter(|p| !p.media_name.is_empty())
            else {
                partial.push(RestoreFrameError::invalid(
                    InvalidProtoDataError::FilePointerMissingMediaName,
                    loggable(),
                ));
                continue;
            };
            if let Err(e) = insert_attachment(ctx.conn, message_row, position, pointer) {
                debug!(error = %e, media = %pointer.media_name, "attachment insert failed");
                partial.push(RestoreFrameError::new(
                    RestoreFrameErrorKind::FailedToCreateAttachment,
                    loggable(),
                ));
            }
        }

        ctx.enqueue_post_frame_action(PostFrameRestoreAction::UpdateChatLastMessage { thread_row });
        if partial.is_empty() {
            RestoreFrameResult::Success(())
        } else {
            RestoreFrameResult::PartialRestore((), partial)
        }
    }
}

fn insert_attachment(
    conn: &Connection,
    message_row: i64,
    position: usize,
    pointer: &FilePointer,
) -> rusqlite::Result<()> {
    let attachment_row: i64 = conn.query_row(
        "INSERT INTO attachment (media_name, size, content_type, digest, downloaded)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT (media_name) DO UPDATE SET
             size = excluded.size,
             content_type = excluded.content_type,
             digest = excluded.digest
         RETURNING id",
        params![
            pointer.media_name,
            to_sql_int(pointer.size),
            pointer.content_type,
            pointer.digest,
            // downloads are scheduled by finalize; nothing is on disk yet
            false,
        ],
        |row| row.get(0),
    )?;
    conn.execute(
        "INSERT OR REPLACE INTO message_attachment (message_id, attachment_id, position)
         VALUES (?1, ?2, ?3)",
        params![message_row, attachment_row, i64::try_from(position).unwrap_or(i64::MAX)],
    )?;
    Ok(())
}
