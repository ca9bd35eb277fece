//! Channel names
//!
//! A channel is written `scope:kind[/param]#user-id[#sub-account-id]`.
//! Public channels carry no user part; user channels always do.

use std::fmt;
use std::str::FromStr;

use common::error::{Error, Result};
use common::model::{SubAccountId, UserId};

/// Who may subscribe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    /// No authorization
    Public,
    /// Only the user named in the channel
    User,
}

impl Scope {
    pub fn as_str(&self) -> &'static str {
        match self {
            Scope::Public => "public",
            Scope::User => "user",
        }
    }
}

/// What a channel carries
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelKind {
    /// `public:market/24h_tick`
    Ticker,
    /// `public:market-depth/<market>`
    Depth(String),
    /// `public:trades/<market>`
    Trades(String),
    /// `public:coins-value`
    CoinsValue,
    /// `user:balances`
    Balances,
    /// `user:orders`
    Orders,
    /// `user:order-update`
    OrderUpdate,
    /// `user:notifications`
    Notifications,
}

impl ChannelKind {
    pub fn scope(&self) -> Scope {
        match self {
            ChannelKind::Ticker
            | ChannelKind::Depth(_)
            | ChannelKind::Trades(_)
            | ChannelKind::CoinsValue => Scope::Public,
            ChannelKind::Balances
            | ChannelKind::Orders
            | ChannelKind::OrderUpdate
            | ChannelKind::Notifications => Scope::User,
        }
    }

    /// Kind name without its parameter, used to index subscriptions
    pub fn tag(&self) -> KindTag {
        match self {
            ChannelKind::Ticker => KindTag::Ticker,
            ChannelKind::Depth(_) => KindTag::Depth,
            ChannelKind::Trades(_) => KindTag::Trades,
            ChannelKind::CoinsValue => KindTag::CoinsValue,
            ChannelKind::Balances => KindTag::Balances,
            ChannelKind::Orders => KindTag::Orders,
            ChannelKind::OrderUpdate => KindTag::OrderUpdate,
            ChannelKind::Notifications => KindTag::Notifications,
        }
    }

    fn parse(kind: &str, param: Option<&str>) -> Result<Self> {
        let market = |param: Option<&str>| -> Result<String> {
            match param {
                Some(m) if !m.is_empty() => Ok(m.to_lowercase()),
                _ => Err(Error::InvalidInput(format!("Channel kind {} needs a market", kind))),
            }
        };
        let bare = |k: ChannelKind| -> Result<Self> {
            match param {
                None => Ok(k),
                Some(p) => Err(Error::InvalidInput(format!(
                    "Channel kind {} takes no parameter, got {}",
                    kind, p
                ))),
            }
        };
        match kind {
            "market" if param == Some("24h_tick") => Ok(ChannelKind::Ticker),
            "market-depth" => Ok(ChannelKind::Depth(market(param)?)),
            "trades" => Ok(ChannelKind::Trades(market(param)?)),
            "coins-value" => bare(ChannelKind::CoinsValue),
            "balances" => bare(ChannelKind::Balances),
            "orders" => bare(ChannelKind::Orders),
            "order-update" => bare(ChannelKind::OrderUpdate),
            "notifications" => bare(ChannelKind::Notifications),
            _ => Err(Error::InvalidInput(format!("Unknown channel kind: {}", kind))),
        }
    }
}

impl fmt::Display for ChannelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChannelKind::Ticker => write!(f, "market/24h_tick"),
            ChannelKind::Depth(m) => write!(f, "market-depth/{}", m),
            ChannelKind::Trades(m) => write!(f, "trades/{}", m),
            ChannelKind::CoinsValue => write!(f, "coins-value"),
            ChannelKind::Balances => write!(f, "balances"),
            ChannelKind::Orders => write!(f, "orders"),
            ChannelKind::OrderUpdate => write!(f, "order-update"),
            ChannelKind::Notifications => write!(f, "notifications"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindTag {
    Ticker,
    Depth,
    Trades,
    CoinsValue,
    Balances,
    Orders,
    OrderUpdate,
    Notifications,
}

/// A parsed channel name
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Channel {
    pub kind: ChannelKind,
    pub user_id: Option<UserId>,
    pub sub_account_id: Option<SubAccountId>,
}

impl Channel {
    pub fn public(kind: ChannelKind) -> Self {
        Self {
            kind,
            user_id: None,
            sub_account_id: None,
        }
    }

    pub fn user(kind: ChannelKind, user_id: UserId, sub_account_id: Option<SubAccountId>) -> Self {
        Self {
            kind,
            user_id: Some(user_id),
            sub_account_id,
        }
    }

    pub fn scope(&self) -> Scope {
        self.kind.scope()
    }
}

impl FromStr for Channel {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = || Error::InvalidInput(format!("Invalid channel: {}", s));

        let (scope, rest) = s.split_once(':').ok_or_else(invalid)?;
        let mut parts = rest.split('#');
        let kind_part = parts.next().ok_or_else(invalid)?;
        let user_id = parts
            .next()
            .map(|u| u.parse::<UserId>().map_err(|_| invalid()))
            .transpose()?;
        let sub_account_id = parts
            .next()
            .map(|s| s.parse::<SubAccountId>().map_err(|_| invalid()))
            .transpose()?;
        if parts.next().is_some() {
            return Err(invalid());
        }

        let (kind, param) = match kind_part.split_once('/') {
            Some((kind, param)) => (kind, Some(param)),
            None => (kind_part, None),
        };
        let kind = ChannelKind::parse(kind, param)?;

        match (scope, kind.scope()) {
            ("public", Scope::Public) if user_id.is_none() => Ok(Channel::public(kind)),
            ("user", Scope::User) => {
                let user_id = user_id.ok_or_else(invalid)?;
                if kind == ChannelKind::Notifications && sub_account_id.is_some() {
                    return Err(invalid());
                }
                Ok(Channel::user(kind, user_id, sub_account_id))
            }
            _ => Err(invalid()),
        }
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.scope().as_str(), self.kind)?;
        if let Some(user_id) = self.user_id {
            write!(f, "#{}", user_id)?;
        }
        if let Some(sub) = self.sub_account_id {
            write!(f, "#{}", sub)?;
        }
        Ok(())
    }
}
