#![forbid(unsafe_code)]

// REST read scenario: each virtual user lists its rooms, then fetches a
// random room's detail and message history. Non-2xx statuses become failed
// checks; the iteration keeps going so one bad endpoint doesn't hide the
// others' numbers.

use crate::api::ApiClient;
use crate::scheduler::WorkerContext;
use tracing::debug;

pub struct RestScenario {
    client: ApiClient,
    history_page_size: u32,
}

impl RestScenario {
    pub fn new(client: ApiClient, history_page_size: u32) -> Self {
        Self {
            client,
            history_page_size,
        }
    }

    pub async fn iteration(&self, ctx: &WorkerContext) -> anyhow::Result<()> {
        let fixtures = &ctx.fixtures;
        if !fixtures.is_usable() {
            return Ok(());
        }
        let Some(user_index) = ctx.fixture_index(fixtures.users.len()) else {
            return Ok(());
        };
        let user = &fixtures.users[user_index];

        match self.client.list_rooms(&user.token).await {
            Ok(response) => {
                ctx.metrics.check("room list 200", response.status == 200);
            }
            Err(e) => {
                ctx.metrics.check("room list 200", false);
                debug!("{}: room list failed: {e}", ctx.vu);
            }
        }

        // Every provisioned user is a member of every fixture room, so any
        // random pick is readable without a 403.
        let room = &fixtures.rooms[rand::random::<u64>() as usize % fixtures.rooms.len()];

        match self.client.room_detail(&user.token, room.id).await {
            Ok(response) => {
                ctx.metrics.check("room detail 200", response.status == 200);
            }
            Err(e) => {
                ctx.metrics.check("room detail 200", false);
                debug!("{}: room detail failed: {e}", ctx.vu);
            }
        }

        match self
            .client
            .message_history(&user.token, room.id, self.history_page_size)
            .await
        {
            Ok(response) => {
                ctx.metrics.check("message history 200", response.status == 200);
            }
            Err(e) => {
                ctx.metrics.check("message history 200", false);
                debug!("{}: message history failed: {e}", ctx.vu);
            }
        }

        Ok(())
    }
}
