//! Telegram gateway built on teloxide.
//!
//! Converts inbound updates into dispatcher [`Event`]s and renders the
//! dispatcher's [`Outbound`] replies back through the Bot API. Send failures
//! are logged and never crash the polling loop.

use std::sync::Arc;

use teloxide::Bot;
use teloxide::dispatching::{Dispatcher as UpdateDispatcher, UpdateFilterExt};
use teloxide::dptree;
use teloxide::payloads::SendMessageSetters;
use teloxide::requests::Requester;
use teloxide::respond;
use teloxide::types::{
    CallbackQuery, ChatId, InlineKeyboardButton, InlineKeyboardMarkup, Message, MessageId,
    ReplyParameters, Update,
};
use tracing::{debug, info, warn};

use crate::dispatch::{self, CallbackAction, Dispatcher, Event, Outbound};

/// Run the bot with long polling until shutdown.
pub async fn run(bot: Bot, dispatcher: Dispatcher) {
    let dispatcher = Arc::new(dispatcher);

    let message_handler = Update::filter_message().endpoint({
        let dispatcher = Arc::clone(&dispatcher);
        move |bot: Bot, msg: Message| {
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                handle_message(&bot, &dispatcher, &msg).await;
                respond(())
            }
        }
    });

    let callback_handler = Update::filter_callback_query().endpoint({
        let dispatcher = Arc::clone(&dispatcher);
        move |bot: Bot, query: CallbackQuery| {
            let dispatcher = Arc::clone(&dispatcher);
            async move {
                handle_callback_query(&bot, &dispatcher, &query).await;
                respond(())
            }
        }
    });

    let handler = dptree::entry()
        .branch(message_handler)
        .branch(callback_handler);

    info!("telegram gateway starting");
    UpdateDispatcher::builder(bot, handler)
        .enable_ctrlc_handler()
        .build()
        .dispatch()
        .await;
    info!("telegram gateway stopped");
}

async fn handle_message(bot: &Bot, dispatcher: &Dispatcher, msg: &Message) {
    let Some(event) = event_from_message(msg) else {
        return;
    };

    let chat_id = msg.chat.id.0;
    let replies = dispatcher.handle(event).await;
    deliver(bot, chat_id, replies).await;
}

async fn handle_callback_query(bot: &Bot, dispatcher: &Dispatcher, query: &CallbackQuery) {
    // Stop the button spinner regardless of what happens next.
    if let Err(e) = bot.answer_callback_query(query.id.clone()).await {
        warn!(error = %e, "failed to answer callback query");
    }

    let Some(data) = &query.data else {
        debug!("ignoring callback query without data");
        return;
    };
    let Some(message) = &query.message else {
        debug!("ignoring callback query without message");
        return;
    };
    let Some(action) = CallbackAction::parse(data) else {
        warn!(payload = %data, "dropping callback with unknown payload");
        return;
    };

    let chat_id = message.chat().id.0;
    let origin_text = message
        .regular_message()
        .and_then(|m| m.reply_to_message())
        .and_then(|m| m.text())
        .map(str::to_string);

    let replies = dispatcher
        .handle(Event::Callback {
            chat_id,
            action,
            origin_text,
        })
        .await;
    deliver(bot, chat_id, replies).await;
}

fn event_from_message(msg: &Message) -> Option<Event> {
    let text = msg.text()?;
    let chat_id = msg.chat.id.0;
    let message_id = msg.id.0;

    if text.starts_with('/') {
        let Some((command, args)) = dispatch::parse_command(text) else {
            debug!(chat_id, text, "ignoring unknown command");
            return None;
        };
        return Some(Event::Command {
            chat_id,
            message_id,
            command,
            args,
        });
    }

    Some(Event::Text {
        chat_id,
        message_id,
        text: text.to_string(),
    })
}

async fn deliver(bot: &Bot, chat_id: i64, replies: Vec<Outbound>) {
    for reply in replies {
        let result = match reply {
            Outbound::Text { text, reply_to } => {
                let mut request = bot.send_message(ChatId(chat_id), text);
                if let Some(message_id) = reply_to {
                    request = request.reply_parameters(ReplyParameters::new(MessageId(message_id)));
                }
                request.await
            }
            Outbound::Keyboard {
                text,
                buttons,
                reply_to,
            } => {
                let rows: Vec<Vec<InlineKeyboardButton>> = buttons
                    .into_iter()
                    .map(|b| vec![InlineKeyboardButton::callback(b.label, b.payload)])
                    .collect();
                let mut request = bot
                    .send_message(ChatId(chat_id), text)
                    .reply_markup(InlineKeyboardMarkup::new(rows));
                if let Some(message_id) = reply_to {
                    request = request.reply_parameters(ReplyParameters::new(MessageId(message_id)));
                }
                request.await
            }
        };

        if let Err(e) = result {
            warn!(chat_id, error = %e, "failed to send message");
        }
    }
}
