use quasar_core::{Amount, Handle, Token};
use regex::Regex;

/// A tip command extracted from mention text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TipIntent {
    pub amount: Amount,
    pub token: Token,
    pub recipient: Handle,
}

const AMOUNT: &str = r"(?P<amount>\d+(?:\.\d+)?)";
const TOKEN: &str = r"(?P<token>bnb|usdc)?";
const RECIPIENT: &str = r"@(?P<recipient>[a-z0-9_]+)";

/// Recognises `@bot tip ...` commands in the three accepted word orders.
#[derive(Debug, Clone)]
pub struct CommandParser {
    patterns: Vec<Regex>,
}

impl CommandParser {
    pub fn new(bot: &Handle) -> Result<Self, regex::Error> {
        let prefix = format!(r"(?i)@{}\s+tip\s+", regex::escape(bot.username()));
        let patterns = [
            // tip 0.5 bnb to @bob, tip 0.5BNB @bob, tip 0.5 to @bob
            format!(r"{prefix}{AMOUNT}\s*{TOKEN}\s+(?:to\s+)?{RECIPIENT}"),
            // tip @bob 0.5 bnb
            format!(r"{prefix}{RECIPIENT}\s+{AMOUNT}\s*{TOKEN}"),
            // tip 0.5 @bob
            format!(r"{prefix}{AMOUNT}\s+(?:to\s+)?{RECIPIENT}"),
        ]
        .iter()
        .map(|p| Regex::new(p))
        .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { patterns })
    }

    /// First matching syntax wins. Zero amounts, amounts finer than the
    /// token's decimals and invalid handles yield `None`.
    pub fn parse(&self, text: &str) -> Option<TipIntent> {
        let caps = self.patterns.iter().find_map(|re| re.captures(text))?;

        let amount = Amount::parse_decimal(caps.name("amount")?.as_str()).ok()?;
        if amount.is_zero() {
            return None;
        }
        let token = match caps.name("token") {
            Some(m) => m.as_str().parse().ok()?,
            None => Token::default(),
        };
        let recipient = Handle::parse(caps.name("recipient")?.as_str())?;

        Some(TipIntent {
            amount,
            token,
            recipient,
        })
    }
}
