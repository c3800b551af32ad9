use super::*;

/// Role of a member within the ensemble.
///
/// Newly admitted members default to `Observer` so they carry no voting
/// weight until explicitly promoted.
#[derive(Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Debug, Default)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Participant,
    #[default]
    Observer,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Participant => f.write_str("participant"),
            Role::Observer => f.write_str("observer"),
        }
    }
}

impl FromStr for Role {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        match s {
            "participant" => Ok(Role::Participant),
            "observer" => Ok(Role::Observer),
            other => Err(Error::malformed("role", format!("unknown role '{other}'"))),
        }
    }
}

/// One ensemble member, as stored in the registry.
///
/// Carries the same information as a server line in the ensemble's dynamic
/// configuration: identity, address, role, and the three port roles (peer
/// replication, leader election, client-facing).
#[derive(Serialize, Deserialize, Clone, PartialEq, Eq, Debug)]
#[serde(rename_all = "camelCase")]
pub struct ServerRecord {
    pub id: ServerId,
    pub address: HostAddress,
    pub role: Role,
    pub peer_port: u16,
    pub election_port: u16,
    pub client_port: u16,
}

impl ServerRecord {
    pub fn new(
        id: ServerId,
        address: HostAddress,
        role: Role,
        peer_port: u16,
        election_port: u16,
        client_port: u16,
    ) -> Result<Self, Error> {
        let record = Self {
            id,
            address,
            role,
            peer_port,
            election_port,
            client_port,
        };
        record.validate()?;
        Ok(record)
    }

    /// Check the record invariants: positive id, pairwise distinct ports.
    pub fn validate(&self) -> Result<(), Error> {
        if self.id == 0 {
            return Err(Error::malformed("server record", "id must be positive"));
        }
        if self.peer_port == self.election_port
            || self.peer_port == self.client_port
            || self.election_port == self.client_port
        {
            return Err(Error::malformed(
                "server record",
                format!(
                    "ports must be distinct (peer={}, election={}, client={})",
                    self.peer_port, self.election_port, self.client_port
                ),
            ));
        }
        Ok(())
    }

    /// The part of a server line to the right of the equals sign:
    /// `address:peerPort:electionPort:role;clientPort`.
    pub fn connection_spec(&self) -> String {
        format!(
            "{}:{}:{}:{};{}",
            self.address, self.peer_port, self.election_port, self.role, self.client_port
        )
    }

    /// The full directive accepted by the ensemble's reconfiguration API:
    /// `server.<id>=<connection spec>`.
    pub fn server_directive(&self) -> String {
        format!("server.{}={}", self.id, self.connection_spec())
    }

    /// The `host:port` pair clients use to reach this member.
    pub fn client_endpoint(&self) -> String {
        format!("{}:{}", self.address, self.client_port)
    }

    /// Parse a `server.<id>=<connection spec>` directive.
    pub fn parse_directive(s: &str) -> Result<Self, Error> {
        let bad = |reason: &str| Error::malformed("server directive", format!("'{s}': {reason}"));
        let rest = s
            .strip_prefix("server.")
            .ok_or_else(|| bad("missing 'server.' prefix"))?;
        let (id, spec) = rest.split_once('=').ok_or_else(|| bad("missing '='"))?;
        let id = id.trim().parse().map_err(|_| bad("non-numeric id"))?;
        Self::parse_connection_spec(id, spec.trim())
    }

    /// Parse an `address:peerPort:electionPort[:role];clientPort` spec.
    /// An omitted role falls back to the default.
    pub fn parse_connection_spec(id: ServerId, s: &str) -> Result<Self, Error> {
        let bad = |reason: String| Error::malformed("connection spec", format!("'{s}': {reason}"));
        let (server_part, client_part) = s
            .split_once(';')
            .ok_or_else(|| bad("missing ';' before client port".to_owned()))?;

        let fields: Vec<&str> = server_part.split(':').collect();
        let (address, peer, election, role) = match fields.as_slice() {
            &[address, peer, election] => (address, peer, election, Role::default()),
            &[address, peer, election, role] => (address, peer, election, role.parse()?),
            _ => return Err(bad(format!("expected 3 or 4 fields, got {}", fields.len()))),
        };

        let port = |name: &str, v: &str| {
            v.parse::<u16>()
                .map_err(|_| bad(format!("invalid {name} port '{v}'")))
        };
        Self::new(
            id,
            address.parse()?,
            role,
            port("peer", peer)?,
            port("election", election)?,
            port("client", client_part)?,
        )
    }
}

/// The scheme token some non-native clients require on connection strings.
pub const CONNECTION_SCHEME: &str = "ens://";

/// Comma-joined `host:clientPort` pairs for client-facing consumption.
pub fn connection_string(servers: &[ServerRecord]) -> String {
    connection_string_with(servers, false, None)
}

/// Connection string with an optional scheme prefix and chroot suffix, so
/// that all paths on the client are relative to the chroot.
pub fn connection_string_with(
    servers: &[ServerRecord],
    with_scheme: bool,
    chroot: Option<&str>,
) -> String {
    let mut out = String::new();
    if with_scheme {
        out.push_str(CONNECTION_SCHEME);
    }
    let endpoints: Vec<String> = servers.iter().map(ServerRecord::client_endpoint).collect();
    out.push_str(&endpoints.join(","));
    if let Some(chroot) = chroot {
        out.push('/');
        out.push_str(chroot.trim_start_matches('/'));
    }
    out
}
