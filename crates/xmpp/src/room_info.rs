use crate::{
    disco::{DataForm, DiscoInfo},
    muc::MUC_NS,
};

pub const MUC_ROOMINFO_FORM_TYPE: &str = "http://jabber.org/protocol/muc#roominfo";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Membership {
    #[default]
    Open,
    MembersOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Anonymity {
    NonAnonymous,
    SemiAnonymous,
    #[default]
    Unknown,
}

/// What a room advertises about itself through disco#info.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RoomInfo {
    pub address: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub subject: Option<String>,
    pub language: Option<String>,
    pub features: Vec<String>,
    pub occupants: Option<u32>,
    pub membership: Membership,
    pub moderated: bool,
    pub password_protected: bool,
    pub persistent: bool,
    pub public: bool,
    pub anonymity: Anonymity,
    pub contacts: Vec<String>,
    pub logs: Option<String>,
    pub max_history_fetch: Option<u32>,
}

impl RoomInfo {
    pub fn from_disco(address: impl Into<String>, info: &DiscoInfo) -> Self {
        let has = |feature: &str| info.has_feature(feature);

        let mut room = RoomInfo {
            address: address.into(),
            name: info
                .identities
                .iter()
                .find(|identity| identity.category == "conference")
                .and_then(|identity| identity.name.clone()),
            features: info.features.clone(),
            membership: if has("muc_membersonly") {
                Membership::MembersOnly
            } else {
                Membership::Open
            },
            moderated: has("muc_moderated"),
            password_protected: has("muc_passwordprotected"),
            persistent: has("muc_persistent"),
            public: has("muc_public") && !has("muc_hidden"),
            anonymity: if has("muc_nonanonymous") {
                Anonymity::NonAnonymous
            } else if has("muc_semianonymous") {
                Anonymity::SemiAnonymous
            } else {
                Anonymity::Unknown
            },
            ..RoomInfo::default()
        };

        if let Some(form) = info.form(MUC_ROOMINFO_FORM_TYPE) {
            room.apply_form(form);
        }
        room
    }

    fn apply_form(&mut self, form: &DataForm) {
        let text = |var: &str| {
            form.value(var)
                .map(str::trim)
                .filter(|value| !value.is_empty())
                .map(str::to_string)
        };
        let number = |var: &str| form.value(var).and_then(|value| value.trim().parse::<u32>().ok());

        self.description = text("muc#roominfo_description");
        self.subject = text("muc#roominfo_subject");
        self.language = text("muc#roominfo_lang");
        self.logs = text("muc#roominfo_logs");
        self.occupants = number("muc#roominfo_occupants");
        self.max_history_fetch = number("muc#maxhistoryfetch");
        self.contacts = form
            .values("muc#roominfo_contactjid")
            .iter()
            .map(|jid| jid.trim().to_string())
            .filter(|jid| !jid.is_empty())
            .collect();
        if self.name.is_none() {
            self.name = text("muc#roomconfig_roomname");
        }
    }

    /// Whether the entity is a multi-user chat room at all.
    pub fn is_room(&self) -> bool {
        self.features.iter().any(|feature| feature == MUC_NS)
    }

    pub fn members_only(&self) -> bool {
        self.membership == Membership::MembersOnly
    }
}
