//! Gateway intent bitmasks and the downgrade ladder.

use bitflags::bitflags;

bitflags! {
    /// Event-category subscription bits sent in the Identify payload.
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
    pub struct Intents: u32 {
        /// `GUILD_CREATE`/`UPDATE`/`DELETE` and channel lifecycle events.
        const GUILDS = 1 << 0;
        /// Guild member add/update/remove.
        const GUILD_MEMBERS = 1 << 1;
        /// Private-domain direct messages to the bot.
        const DIRECT_MESSAGE = 1 << 12;
        /// Group and C2C (user-to-bot) message events.
        const GROUP_AND_C2C = 1 << 25;
        /// Public-domain `AT_MESSAGE_CREATE` in guild channels.
        const PUBLIC_GUILD_MESSAGES = 1 << 30;
    }
}

/// Ordered ladder of intent levels tried on connect, most-privileged first.
///
/// Index 0 is attempted first unless a more restrictive level already
/// succeeded previously; on an unresumable Invalid Session the gateway
/// advances one step, capped at the last index.
pub const INTENT_LEVELS: [Intents; 3] = [
    // full
    Intents::from_bits_truncate(
        Intents::PUBLIC_GUILD_MESSAGES.bits()
            | Intents::DIRECT_MESSAGE.bits()
            | Intents::GROUP_AND_C2C.bits(),
    ),
    // group + channel (drops direct messages)
    Intents::from_bits_truncate(
        Intents::PUBLIC_GUILD_MESSAGES.bits() | Intents::GROUP_AND_C2C.bits(),
    ),
    // channel-only
    Intents::from_bits_truncate(Intents::PUBLIC_GUILD_MESSAGES.bits() | Intents::GUILD_MEMBERS.bits()),
];

/// Highest valid index into [`INTENT_LEVELS`].
pub const MAX_INTENT_LEVEL: usize = INTENT_LEVELS.len() - 1;

/// Clamp an intent level index, advancing by one step but never past the
/// last (least-privileged) level.
pub fn downgrade(level: usize) -> usize {
    (level + 1).min(MAX_INTENT_LEVEL)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn full_intents_match_spec_bitmask() {
        assert_eq!(INTENT_LEVELS[0].bits(), 0x4000_1000 | 0x0200_0000);
        assert_eq!(INTENT_LEVELS[0].bits(), 0x4200_1000);
    }

    #[test]
    fn downgrade_saturates_at_last_level() {
        assert_eq!(downgrade(0), 1);
        assert_eq!(downgrade(1), 2);
        assert_eq!(downgrade(2), 2);
        assert_eq!(downgrade(50), 2);
    }
}
