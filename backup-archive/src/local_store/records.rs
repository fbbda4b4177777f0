// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! Installed sticker packs and ad-hoc call records.

use rusqlite::params;

use super::{fetch_all, from_sql_int, to_sql_int};
use crate::{
    archiver::{ArchiveMultiFrameResult, FrameArchiver, FrameSink, RestoreFrameResult, write_frame},
    context::{ArchivingContext, RecipientId, RecipientKind, RestoringContext},
    frame_error::{
        ArchiveFrameError, ArchiveFrameErrorKind, InvalidProtoDataError, LoggableId,
        RestoreFrameError, UnrecognizedEnumError,
    },
    proto::{AdHocCall, AdHocCallState, Frame, StickerPack, frame},
};

const STICKER_PACK_ID_LEN: usize = 16;
const STICKER_PACK_KEY_LEN: usize = 32;

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteStickerPacks;

impl FrameArchiver<StickerPack> for SqliteStickerPacks {
    fn archive(&self, sink: &mut dyn FrameSink, ctx: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
        let packs = match fetch_all(
            ctx.conn,
            "sticker packs",
            "SELECT pack_id, pack_key FROM sticker_pack ORDER BY pack_id",
            [],
            |row| {
                Ok(StickerPack {
                    pack_id: row.get(0)?,
                    pack_key: row.get(1)?,
                })
            },
        ) {
            Ok(packs) => packs,
            Err(fatal) => return ArchiveMultiFrameResult::CompleteFailure(fatal),
        };
        let mut errors = Vec::new();
        for pack in packs {
            let id = LoggableId::sticker_pack(&pack.pack_id);
            if pack.pack_key.len() != STICKER_PACK_KEY_LEN {
                errors.push(ArchiveFrameError::new(
                    ArchiveFrameErrorKind::InvalidLocalData("sticker pack key".to_string()),
                    id,
                ));
                continue;
            }
            if let Err(e) = write_frame(sink, &Frame::new(frame::Item::StickerPack(pack)), || id) {
                errors.push(e);
            }
        }
        ArchiveMultiFrameResult::from_errors(errors)
    }

    fn restore(&self, proto: &StickerPack, ctx: &RestoringContext<'_>) -> RestoreFrameResult<()> {
        let loggable = || LoggableId::sticker_pack(&proto.pack_id);
        if proto.pack_id.len() != STICKER_PACK_ID_LEN || proto.pack_key.len() != STICKER_PACK_KEY_LEN {
            return RestoreFrameResult::failure(RestoreFrameError::invalid(
                InvalidProtoDataError::InvalidStickerPack,
                loggable(),
            ));
        }
        match ctx.conn.execute(
            "INSERT INTO sticker_pack (pack_id, pack_key) VALUES (?1, ?2)
             ON CONFLICT (pack_id) DO UPDATE SET pack_key = excluded.pack_key",
            params![proto.pack_id, proto.pack_key],
        ) {
            Ok(_) => RestoreFrameResult::Success(()),
            Err(e) => RestoreFrameResult::failure(RestoreFrameError::database(&e, loggable())),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAdHocCalls;

impl FrameArchiver<AdHocCall> for SqliteAdHocCalls {
    fn archive(&self, sink: &mut dyn FrameSink, ctx: &ArchivingContext<'_>) -> ArchiveMultiFrameResult {
        let calls = match fetch_all(
            ctx.conn,
            "call records",
            "SELECT c.call_id, c.recipient_id, c.state, c.timestamp_ms
             FROM call_record c JOIN recipient r ON r.id = c.recipient_id
             WHERE r.kind = 'call_link'
             ORDER BY c.call_id",
            [],
            |row| {
                Ok((
                    from_sql_int(row.get(0)?),
                    row.get::<_, i64>(1)?,
                    row.get::<_, i32>(2)?,
                    from_sql_int(row.get(3)?),
                ))
            },
        ) {
            Ok(calls) => calls,
            Err(fatal) => return ArchiveMultiFrameResult::CompleteFailure(fatal),
        };
        let mut errors = Vec::new();
        for (call_id, recipient_row, state, call_timestamp) in calls {
            // expired call links are not archived, and neither are their calls
            let Some(recipient) = ctx.recipient_id(recipient_row) else {
                errors.push(ArchiveFrameError::new(
                    ArchiveFrameErrorKind::ReferencedRecipientMissing(recipient_row),
                    LoggableId::ad_hoc_call(call_id),
                ));
                continue;
            };
            let call = AdHocCall {
                call_id,
                recipient_id: recipient.0,
                state,
                call_timestamp,
            };
            if let Err(e) = write_frame(sink, &Frame::new(frame::Item::AdHocCall(call)), || {
                LoggableId::ad_hoc_call(call_id)
            }) {
                errors.push(e);
            }
        }
        ArchiveMultiFrameResult::from_errors(errors)
    }

    fn restore(&self, proto: &AdHocCall, ctx: &RestoringContext<'_>) -> RestoreFrameResult<()> {
        let loggable = || LoggableId::ad_hoc_call(proto.call_id);
        let Some(recipient) = ctx.recipient(RecipientId(proto.recipient_id)) else {
            return RestoreFrameResult::failure(RestoreFrameError::invalid(
                InvalidProtoDataError::RecipientIdNotFound(proto.recipient_id),
                loggable(),
            ));
        };
        if recipient.kind != RecipientKind::CallLink {
            return RestoreFrameResult::failure(RestoreFrameError::invalid(
                InvalidProtoDataError::AdHocCallNotCallLink(proto.recipient_id),
                loggable(),
            ));
        }
        let state = match AdHocCallState::try_from(proto.state) {
            Ok(state) if state != AdHocCallState::UnknownState => state,
            _ => {
                return RestoreFrameResult::UnrecognizedEnum(UnrecognizedEnumError::new(
                    "AdHocCall.State",
                    proto.state,
                    loggable(),
                ));
            }
        };
        match ctx.conn.execute(
            "INSERT INTO call_record (call_id, recipient_id, state, timestamp_ms)
             VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (call_id) DO UPDATE SET
                 recipient_id = excluded.recipient_id,
                 state = excluded.state,
                 timestamp_ms = excluded.timestamp_ms",
            params![
                to_sql_int(proto.call_id),
                recipient.row_id,
                i32::from(state),
                to_sql_int(proto.call_timestamp),
            ],
        ) {
            Ok(_) => RestoreFrameResult::Success(()),
            Err(e) => RestoreFrameResult::failure(RestoreFrameError::database(&e, loggable())),
        }
    }
}
