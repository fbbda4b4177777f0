// SPDX-FileCopyrightText: 2025-2026 Steve Schoettler
// SPDX-License-Identifier: Apache-2.0

//! The account record and the local account's own recipient.

use rusqlite::{OptionalExtension, params};

use super::{PROFILE_KEY_LEN, from_sql_int, parse_e164, to_sql_int};
use crate::{
    archiver::{
        AccountDataArchiver, ArchiveSingleFrameResult, FrameSink, LocalRecipientArchiver,
        RestoreFrameResult, write_frame,
    },
    context::{ArchivingContext, RecipientId, RecipientKind, RestoringContext},
    frame_error::{
        ArchiveFrameError, ArchiveFrameErrorKind, InvalidProtoDataError, LoggableId,
        RestoreFrameError,
    },
    proto::{AccountData, AccountSettings, Frame, Recipient, SelfRecipient, frame, recipient},
};

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteAccountData;

impl AccountDataArchiver for SqliteAccountData {
    fn archive(
        &self,
        sink: &mut dyn FrameSink,
        ctx: &ArchivingContext<'_>,
    ) -> ArchiveSingleFrameResult<()> {
        let data = ctx
            .conn
            .query_row(
                "SELECT profile_key, username, given_name, family_name, read_receipts,
                        typing_indicators, universal_expire_timer_seconds, display_badges_on_profile
                 FROM account WHERE id = 1",
                [],
                |row| {
                    Ok(AccountData {
                        profile_key: row.get(0)?,
                        username: row.get(1)?,
                        given_name: row.get(2)?,
                        family_name: row.get(3)?,
                        account_settings: Some(AccountSettings {
                            read_receipts: row.get(4)?,
                            typing_indicators: row.get(5)?,
                            universal_expire_timer_seconds: u32::try_from(from_sql_int(
                                row.get(6)?,
                            ))
                            .unwrap_or(u32::MAX),
                            display_badges_on_profile: row.get(7)?,
                        }),
                    })
                },
            )
            .optional()
            .map_err(|e| {
                ArchiveFrameError::new(
                    ArchiveFrameErrorKind::FetchFailed(e.to_string()),
                    LoggableId::account_data(),
                )
            })?
            .ok_or_else(|| {
                ArchiveFrameError::new(
                    ArchiveFrameErrorKind::InvalidLocalData("no local account".to_string()),
                    LoggableId::account_data(),
                )
            })?;
        if data.profile_key.len() != PROFILE_KEY_LEN {
            return Err(ArchiveFrameError::new(
                ArchiveFrameErrorKind::InvalidLocalData("local profile key is missing".to_string()),
                LoggableId::account_data(),
            ));
        }
        write_frame(sink, &Frame::new(frame::Item::Account(data)), LoggableId::account_data)
    }

    fn restore(&self, data: &AccountData, ctx: &RestoringContext<'_>) -> RestoreFrameResult<()> {
        if data.profile_key.len() != PROFILE_KEY_LEN {
            return RestoreFrameResult::failure(RestoreFrameError::invalid(
                InvalidProtoDataError::MissingLocalProfileKey,
                LoggableId::account_data(),
            ));
        }
        let settings = data.account_settings.clone().unwrap_or_default();
        let result = ctx.conn.execute(
            "INSERT INTO account (id, profile_key, username, given_name, family_name, read_receipts,
                 typing_indicators, universal_expire_timer_seconds, display_badges_on_profile)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT (id) DO UPDATE SET
                 profile_key = excluded.profile_key,
                 username = excluded.username,
                 given_name = excluded.given_name,
                 family_name = excluded.family_name,
                 read_receipts = excluded.read_receipts,
                 typing_indicators = excluded.typing_indicators,
                 universal_expire_timer_seconds = excluded.universal_expire_timer_seconds,
                 display_badges_on_profile = excluded.display_badges_on_profile",
            params![
                data.profile_key,
                data.username,
                data.given_name,
                data.family_name,
                settings.read_receipts,
                settings.typing_indicators,
                settings.universal_expire_timer_seconds,
                settings.display_badges_on_profile,
            ],
        );
        match result {
            Ok(_) => RestoreFrameResult::Success(()),
            Err(e) => RestoreFrameResult::failure(RestoreFrameError::database(
                &e,
                LoggableId::account_data(),
            )),
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SqliteLocalRecipient;

impl LocalRecipientArchiver for SqliteLocalRecipient {
    fn archive(
        &self,
        sink: &mut dyn FrameSink,
        ctx: &ArchivingContext<'_>,
    ) -> ArchiveSingleFrameResult<RecipientId> {
        let row_id: i64 = ctx
            .conn
            .query_row(
                "SELECT id FROM recipient WHERE kind = 'self_recipient'",
                [],
                |row| row.get(0),
            )
            .optional()
            .map_err(|e| {
                ArchiveFrameError::new(
                    ArchiveFrameErrorKind::FetchFailed(e.to_string()),
                    LoggableId::local_row("recipient", 0),
                )
            })?
            .ok_or_else(|| {
                ArchiveFrameError::new(
                    ArchiveFrameErrorKind::InvalidLocalData("no self recipient".to_string()),
                    LoggableId::local_row("recipient", 0),
                )
            })?;
        let id = ctx.assign_recipient_id(row_id);
        let frame = Frame::new(frame::Item::Recipient(Recipient {
            id: id.0,
            destination: Some(recipient::Destination::SelfRecipient(SelfRecipient {})),
        }));
        write_frame(sink, &frame, || LoggableId::recipient(id.0))?;
        Ok(id)
    }

    fn restore(
        &self,
        id: RecipientId,
        _proto: &SelfRecipient,
        ctx: &RestoringContext<'_>,
    ) -> RestoreFrameResult<()> {
        let loggable = || LoggableId::recipient(id.0);
        let existing = ctx
            .conn
            .query_row(
                "SELECT id FROM recipient WHERE kind = 'self_recipient'",
                [],
                |row| row.get::<_, i64>(0),
            )
            .optional();
        let row_id = match existing {
            Ok(Some(row_id)) => row_id,
            Ok(None) => {
                let e164 = ctx.local.e164.as_deref().and_then(parse_e164).map(to_sql_int);
                match ctx.conn.execute(
                    "INSERT INTO recipient (kind, aci, e164) VALUES ('self_recipient', ?1, ?2)",
                    params![ctx.local.aci.as_str(), e164],
                ) {
                    Ok(_) => ctx.conn.last_insert_rowid(),
                    Err(e) => return RestoreFrameResult::failure(RestoreFrameError::database(&e, loggable())),
                }
            }
            Err(e) => return RestoreFrameResult::failure(RestoreFrameError::database(&e, loggable())),
        };
        ctx.map_recipient(id, row_id, RecipientKind::SelfRecipient);
        RestoreFrameResult::Success(())
    }
}
