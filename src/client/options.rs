#[cfg(test)]
mod test;

use std::{
    fmt::{self, Display, Formatter},
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
    time::Duration,
};

use derive_where::derive_where;
use percent_encoding::percent_decode_str;
use serde::{de::Error as SerdeError, Deserialize, Deserializer, Serialize, Serializer};
use typed_builder::TypedBuilder;

use crate::{
    client::auth::{AuthProvider, Credential},
    error::{Error, ErrorKind, Result},
    event::{cmap::CmapEvent, command::CommandEvent, sdam::SdamEvent, EventHandler},
    runtime::StreamConnector,
    sdam::MIN_HEARTBEAT_FREQUENCY,
    selection_criteria::{ReadPreference, ReadPreferenceOptions, SelectionCriteria, TagSet},
};

pub(crate) const DEFAULT_PORT: u16 = 27017;

const URI_OPTIONS: &[&str] = &[
    "appname",
    "authmechanism",
    "authsource",
    "connecttimeoutms",
    "directconnection",
    "heartbeatfrequencyms",
    "localthresholdms",
    "maxidletimems",
    "maxpoolsize",
    "maxstalenessseconds",
    "minpoolsize",
    "readpreference",
    "readpreferencetags",
    "replicaset",
    "retryreads",
    "retrywrites",
    "serverselectiontimeoutms",
    "waitqueuetimeoutms",
];

/// An enum representing the address of a MongoDB server.
#[derive(Clone, Debug, Eq)]
#[non_exhaustive]
pub enum ServerAddress {
    /// A TCP/IP host and port combination.
    Tcp {
        /// The hostname or IP address where the MongoDB server can be found.
        host: String,

        /// The TCP port that the MongoDB server is listening on.
        ///
        /// The default is 27017.
        port: Option<u16>,
    },
}

impl<'de> Deserialize<'de> for ServerAddress {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = Deserialize::deserialize(deserializer)?;
        Self::parse(s.as_str()).map_err(|e| D::Error::custom(format!("{}", e)))
    }
}

impl Serialize for ServerAddress {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl Default for ServerAddress {
    fn default() -> Self {
        Self::Tcp {
            host: "localhost".into(),
            port: None,
        }
    }
}

impl PartialEq for ServerAddress {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (
                Self::Tcp { host, port },
                Self::Tcp {
                    host: other_host,
                    port: other_port,
                },
            ) => host == other_host && port.unwrap_or(DEFAULT_PORT) == other_port.unwrap_or(DEFAULT_PORT),
        }
    }
}

impl Hash for ServerAddress {
    fn hash<H>(&self, state: &mut H)
    where
        H: Hasher,
    {
        match self {
            Self::Tcp { host, port } => {
                host.hash(state);
                port.unwrap_or(DEFAULT_PORT).hash(state);
            }
        }
    }
}

impl FromStr for ServerAddress {
    type Err = Error;
    fn from_str(address: &str) -> Result<Self> {
        ServerAddress::parse(address)
    }
}

impl ServerAddress {
    /// Parses an address string into a `ServerAddress`.
    pub fn parse(address: impl AsRef<str>) -> Result<Self> {
        let address = address.as_ref();

        let (hostname, port) = if let Some(ip_literal) = address.strip_prefix('[') {
            let (hostname, rest) = ip_literal.split_once(']').ok_or_else(|| {
                Error::invalid_argument(format!(
                    "invalid server address {}: missing closing ']' in IP literal hostname",
                    address
                ))
            })?;
            let port = match rest {
                "" => None,
                rest => Some(rest.strip_prefix(':').ok_or_else(|| {
                    Error::invalid_argument(format!(
                        "invalid server address {}: the hostname can only be followed by a port \
                         prefixed with ':', got {}",
                        address, rest
                    ))
                })?),
            };
            (hostname, port)
        } else {
            match address.split_once(':') {
                Some((hostname, port)) => (hostname, Some(port)),
                None => (address, None),
            }
        };

        if hostname.is_empty() {
            return Err(Error::invalid_argument(format!(
                "invalid server address {}: the hostname cannot be empty",
                address
            )));
        }

        let port = match port {
            Some(port) => match u16::from_str(port) {
                Ok(0) | Err(_) => {
                    return Err(Error::invalid_argument(format!(
                        "invalid server address {}: the port must be an integer between 1 and \
                         65535, got {}",
                        address, port
                    )))
                }
                Ok(port) => Some(port),
            },
            None => None,
        };

        Ok(Self::Tcp {
            host: hostname.to_lowercase(),
            port,
        })
    }

    /// The hostname or IP address of this address.
    pub fn host(&self) -> &str {
        match self {
            Self::Tcp { host, .. } => host.as_str(),
        }
    }

    /// The port of this address, if one was specified.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::Tcp { port, .. } => *port,
        }
    }
}

impl Display for ServerAddress {
    fn fmt(&self, fmt: &mut Formatter) -> fmt::Result {
        match self {
            Self::Tcp { host, port } => {
                if host.contains(':') {
                    write!(fmt, "[{}]:{}", host, port.unwrap_or(DEFAULT_PORT))
                } else {
                    write!(fmt, "{}:{}", host, port.unwrap_or(DEFAULT_PORT))
                }
            }
        }
    }
}

/// Contains the options that can be used to create a new [`Client`](crate::Client).
#[derive(Clone, Default, TypedBuilder)]
#[derive_where(Debug)]
#[builder(field_defaults(default, setter(into)))]
#[non_exhaustive]
pub struct ClientOptions {
    /// Seed addresses. Other members are discovered from the seeds' hello replies unless
    /// `direct_connection` is set.
    #[builder(default_code = "vec![ServerAddress::Tcp {
        host: \"localhost\".to_string(),
        port: Some(27017),
    }]")]
    pub hosts: Vec<ServerAddress>,

    /// The application name that the Client will send to the server as part of the handshake.
    pub app_name: Option<String>,

    /// Required replica set name. Members reporting another set name are removed.
    pub repl_set_name: Option<String>,

    /// Talk to the single seed only, whatever it reports about other members. Requires exactly
    /// one host.
    ///
    /// Defaults to false.
    pub direct_connection: Option<bool>,

    /// The amount of time each monitoring task should wait between performing server checks.
    ///
    /// The default value is 10 seconds.
    pub heartbeat_freq: Option<Duration>,

    /// Width of the latency window. Of the servers suitable for an operation, only those whose
    /// average round trip time is at most this much above the fastest one's are candidates.
    /// With servers at 5, 10 and 15 ms and a threshold of 8 ms, the first two are candidates.
    ///
    /// Zero leaves only the fastest server. Defaults to 15 ms.
    pub local_threshold: Option<Duration>,

    /// How long an operation waits for a suitable server before failing with a server
    /// selection error.
    ///
    /// Defaults to 30 seconds.
    pub server_selection_timeout: Option<Duration>,

    /// The connect timeout passed to each underlying TcpStream when attempting to connect to the
    /// server.
    ///
    /// The default value is 10 seconds.
    pub connect_timeout: Option<Duration>,

    /// Upper bound on the connections, checked out or idle, that one server's pool may hold.
    /// Checkouts beyond it wait in a FIFO queue until a connection is checked back in.
    ///
    /// Defaults to 10. Zero means no bound.
    pub max_pool_size: Option<u32>,

    /// The minimum number of connections that should be available in a server's connection pool
    /// at a given time. If fewer than `min_pool_size` connections are in the pool, connections
    /// will be added to the pool in the background until `min_pool_size` is reached.
    ///
    /// The default value is 0.
    pub min_pool_size: Option<u32>,

    /// Idle connections older than this are closed by the pool. Unset or zero keeps idle
    /// connections open indefinitely.
    pub max_idle_time: Option<Duration>,

    /// How long an operation waits for a connection to become available in a pool that is at
    /// its maximum size before failing with a pool timeout error.
    ///
    /// By default, operations wait for as long as their server selection timeout.
    pub wait_queue_timeout: Option<Duration>,

    /// Retry reads once after a retryable error. Defaults to true.
    pub retry_reads: Option<bool>,

    /// Retry writes once after a retryable error, on deployments that support it. Defaults to
    /// true.
    pub retry_writes: Option<bool>,

    /// The default selection criteria for operations run by the Client.
    pub selection_criteria: Option<SelectionCriteria>,

    /// The credential handed to the `auth_provider` on every new connection.
    pub credential: Option<Credential>,

    /// Performs authentication on newly established connections.
    #[derive_where(skip)]
    #[builder(setter(strip_option))]
    pub auth_provider: Option<Arc<dyn AuthProvider>>,

    /// The handler that should process all Server Discovery and Monitoring events.
    #[derive_where(skip)]
    #[builder(setter(strip_option))]
    pub sdam_event_handler: Option<EventHandler<SdamEvent>>,

    /// The handler that should process all Connection Monitoring and Pooling events.
    #[derive_where(skip)]
    #[builder(setter(strip_option))]
    pub cmap_event_handler: Option<EventHandler<CmapEvent>>,

    /// The handler that should process all command-related events.
    ///
    /// Note that monitoring command events may incur a performance penalty.
    #[derive_where(skip)]
    #[builder(setter(strip_option))]
    pub command_event_handler: Option<EventHandler<CommandEvent>>,

    /// Opens the byte streams that connections run over. Defaults to plain TCP.
    #[derive_where(skip)]
    #[builder(setter(strip_option))]
    pub stream_connector: Option<Arc<dyn StreamConnector>>,

    /// Options only used to speed up or isolate unit tests.
    #[cfg(test)]
    #[builder(setter(skip))]
    pub(crate) test_options: Option<TestOptions>,
}

#[cfg(test)]
#[derive(Clone, Debug, Default)]
pub(crate) struct TestOptions {
    /// Override the minimum heartbeat frequency.
    pub(crate) min_heartbeat_freq: Option<Duration>,

    /// Disable server monitoring tasks.
    pub(crate) disable_monitoring_threads: bool,
}

impl ClientOptions {
    /// Parses a `mongodb://` connection string.
    ///
    /// The format of a connection string is
    /// `mongodb://[username:password@]host1[:port1][,host2[:port2]...][/[defaultauthdb][?options]]`.
    ///
    /// The following options are supported (case-insensitive): `appName`, `authMechanism`,
    /// `authSource`, `connectTimeoutMS`, `directConnection`, `heartbeatFrequencyMS`,
    /// `localThresholdMS`, `maxIdleTimeMS`, `maxPoolSize`, `maxStalenessSeconds`, `minPoolSize`,
    /// `readPreference`, `readPreferenceTags`, `replicaSet`, `retryReads`, `retryWrites`,
    /// `serverSelectionTimeoutMS` and `waitQueueTimeoutMS`. Unknown options are ignored.
    pub fn parse(s: impl AsRef<str>) -> Result<Self> {
        let parts = ConnectionString::parse(s.as_ref())?;
        let options = ClientOptions::from(parts);
        options.validate()?;
        Ok(options)
    }

    /// Ensure the options set are valid.
    pub(crate) fn validate(&self) -> Result<()> {
        if self.hosts.is_empty() {
            return Err(Error::invalid_argument("at least one host must be specified"));
        }

        if self.direct_connection == Some(true) && self.hosts.len() > 1 {
            return Err(Error::invalid_argument(
                "cannot specify multiple seeds with directConnection=true",
            ));
        }

        if let Some(heartbeat_frequency) = self.heartbeat_freq {
            if heartbeat_frequency < self.min_heartbeat_frequency() {
                return Err(ErrorKind::InvalidArgument {
                    message: format!(
                        "'heartbeat_freq' must be at least {}ms, but {}ms was given",
                        self.min_heartbeat_frequency().as_millis(),
                        heartbeat_frequency.as_millis()
                    ),
                }
                .into());
            }
        }

        if let (Some(min), Some(max)) = (self.min_pool_size, self.max_pool_size) {
            if max != 0 && min > max {
                return Err(Error::invalid_argument(format!(
                    "min_pool_size ({}) must not exceed max_pool_size ({})",
                    min, max
                )));
            }
        }

        if let Some(credential) = self.credential.as_ref() {
            if credential.username.as_deref() == Some("") {
                return Err(Error::invalid_argument("username must not be empty"));
            }
        }

        Ok(())
    }

    pub(crate) fn min_heartbeat_frequency(&self) -> Duration {
        #[cfg(test)]
        if let Some(min) = self
            .test_options
            .as_ref()
            .and_then(|to| to.min_heartbeat_freq)
        {
            return min;
        }
        MIN_HEARTBEAT_FREQUENCY
    }

    #[cfg(test)]
    pub(crate) fn test_options_mut(&mut self) -> &mut TestOptions {
        self.test_options.get_or_insert_with(Default::default)
    }
}

/// The pieces of a connection string, prior to conversion into `ClientOptions`.
#[derive(Debug, Default)]
struct ConnectionString {
    hosts: Vec<ServerAddress>,
    app_name: Option<String>,
    repl_set_name: Option<String>,
    direct_connection: Option<bool>,
    heartbeat_frequency: Option<Duration>,
    local_threshold: Option<Duration>,
    server_selection_timeout: Option<Duration>,
    connect_timeout: Option<Duration>,
    max_pool_size: Option<u32>,
    min_pool_size: Option<u32>,
    max_idle_time: Option<Duration>,
    wait_queue_timeout: Option<Duration>,
    retry_reads: Option<bool>,
    retry_writes: Option<bool>,
    read_preference: Option<ReadPreference>,
    read_preference_tags: Option<Vec<TagSet>>,
    max_staleness: Option<Duration>,
    credential: Option<Credential>,
    auth_source: Option<String>,
    auth_mechanism: Option<String>,
}

impl From<ConnectionString> for ClientOptions {
    fn from(conn_str: ConnectionString) -> Self {
        Self {
            hosts: conn_str.hosts,
            app_name: conn_str.app_name,
            repl_set_name: conn_str.repl_set_name,
            direct_connection: conn_str.direct_connection,
            heartbeat_freq: conn_str.heartbeat_frequency,
            local_threshold: conn_str.local_threshold,
            server_selection_timeout: conn_str.server_selection_timeout,
            connect_timeout: conn_str.connect_timeout,
            max_pool_size: conn_str.max_pool_size,
            min_pool_size: conn_str.min_pool_size,
            max_idle_time: conn_str.max_idle_time,
            wait_queue_timeout: conn_str.wait_queue_timeout,
            retry_reads: conn_str.retry_reads,
            retry_writes: conn_str.retry_writes,
            selection_criteria: conn_str.read_preference.map(Into::into),
            credential: conn_str.credential,
            ..Default::default()
        }
    }
}

impl ConnectionString {
    fn parse(s: &str) -> Result<Self> {
        let after_scheme = s.strip_prefix("mongodb://").ok_or_else(|| {
            Error::invalid_argument(
                "connection string must start with \"mongodb://\"",
            )
        })?;

        let (pre_slash, post_slash) = match after_scheme.split_once('/') {
            Some((pre, post)) => (pre, Some(post)),
            None => {
                if after_scheme.contains('?') {
                    return Err(Error::invalid_argument(
                        "missing delimiting slash between hosts and options",
                    ));
                }
                (after_scheme, None)
            }
        };

        let (database, options_section) = match post_slash {
            Some(section) => match section.split_once('?') {
                Some((db, options)) => (db, Some(options)),
                None => (section, None),
            },
            None => ("", None),
        };

        let (user_info, hosts_section) = match pre_slash.rsplit_once('@') {
            Some((user_info, hosts)) => (Some(user_info), hosts),
            None => (None, pre_slash),
        };

        let hosts = hosts_section
            .split(',')
            .map(|host| ServerAddress::parse(decode(host)?))
            .collect::<Result<Vec<_>>>()?;

        let mut conn_str = ConnectionString {
            hosts,
            ..Default::default()
        };

        if let Some(user_info) = user_info {
            let (username, password) = match user_info.split_once(':') {
                Some((username, password)) => (username, Some(password)),
                None => (user_info, None),
            };
            if username.is_empty() {
                return Err(Error::invalid_argument("username must not be empty"));
            }
            conn_str.credential = Some(
                Credential::builder()
                    .username(decode(username)?)
                    .password(password.map(decode).transpose()?)
                    .build(),
            );
        }

        if let Some(options) = options_section {
            conn_str.parse_options(options)?;
        }

        let database = decode(database)?;
        if let Some(credential) = conn_str.credential.as_mut() {
            credential.source = conn_str
                .auth_source
                .take()
                .or_else(|| (!database.is_empty()).then_some(database));
            credential.mechanism = conn_str.auth_mechanism.take();
        }

        let mut read_preference = conn_str.read_preference.take();
        if let Some(tags) = conn_str.read_preference_tags.take() {
            read_preference = match read_preference {
                Some(read_pref) => Some(read_pref.with_tags(tags)?),
                None => {
                    return Err(Error::invalid_argument(
                        "cannot set read preference tags without also setting read preference \
                         mode",
                    ))
                }
            };
        }
        if let Some(max_staleness) = conn_str.max_staleness.take() {
            read_preference = match read_preference {
                Some(read_pref) => Some(read_pref.with_max_staleness(max_staleness)?),
                None => {
                    return Err(Error::invalid_argument(
                        "cannot set max staleness without also setting read preference mode",
                    ))
                }
            };
        }
        conn_str.read_preference = read_preference;

        Ok(conn_str)
    }

    fn parse_options(&mut self, options: &str) -> Result<()> {
        if options.is_empty() {
            return Ok(());
        }

        for option_pair in options.split('&') {
            let (key, value) = option_pair.split_once('=').ok_or_else(|| {
                Error::invalid_argument(format!(
                    "connection string options is not a `key=value` pair: {}",
                    option_pair,
                ))
            })?;

            let key = key.to_lowercase();
            if !URI_OPTIONS.contains(&key.as_str()) {
                continue;
            }
            self.parse_option_pair(&key, &decode(value)?)?;
        }

        Ok(())
    }

    fn parse_option_pair(&mut self, key: &str, value: &str) -> Result<()> {
        macro_rules! get_bool {
            ($value:expr, $option:expr) => {
                match $value {
                    "true" => true,
                    "false" => false,
                    _ => {
                        return Err(Error::invalid_argument(format!(
                            "connection string `{}` option must be a boolean",
                            $option,
                        )))
                    }
                }
            };
        }

        macro_rules! get_duration {
            ($value:expr, $option:expr) => {
                match u64::from_str($value) {
                    Ok(i) => i,
                    _ => {
                        return Err(Error::invalid_argument(format!(
                            "connection string `{}` option must be a non-negative integer",
                            $option
                        )))
                    }
                }
            };
        }

        macro_rules! get_u32 {
            ($value:expr, $option:expr) => {
                match u32::from_str($value) {
                    Ok(u) => u,
                    Err(_) => {
                        return Err(Error::invalid_argument(format!(
                            "connection string `{}` argument must be a non-negative integer",
                            $option
                        )))
                    }
                }
            };
        }

        match key {
            "appname" => self.app_name = Some(value.to_string()),
            "authmechanism" => self.auth_mechanism = Some(value.to_string()),
            "authsource" => self.auth_source = Some(value.to_string()),
            k @ "connecttimeoutms" => {
                self.connect_timeout = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "directconnection" => self.direct_connection = Some(get_bool!(value, k)),
            k @ "heartbeatfrequencyms" => {
                self.heartbeat_frequency = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "localthresholdms" => {
                self.local_threshold = Some(Duration::from_millis(get_duration!(value, k)))
            }
            k @ "maxidletimems" => {
                self.max_idle_time = Some(Duration::from_millis(get_duration!(value, k)));
            }
            k @ "maxpoolsize" => self.max_pool_size = Some(get_u32!(value, k)),
            k @ "minpoolsize" => self.min_pool_size = Some(get_u32!(value, k)),
            "maxstalenessseconds" => {
                self.max_staleness = match i64::from_str(value) {
                    Ok(-1) => None,
                    Ok(secs) if secs > 0 => Some(Duration::from_secs(secs as u64)),
                    _ => {
                        return Err(Error::invalid_argument(
                            "connection string `maxStalenessSeconds` option must be -1 or a \
                             positive integer",
                        ))
                    }
                }
            }
            "readpreference" => {
                self.read_preference = Some(ReadPreference::from_mode(
                    value,
                    None::<ReadPreferenceOptions>,
                )?);
            }
            "readpreferencetags" => {
                let tags: Result<TagSet> = if value.is_empty() {
                    Ok(TagSet::new())
                } else {
                    value
                        .split(',')
                        .map(|tag| match tag.split_once(':') {
                            Some((key, value)) => Ok((key.to_string(), value.to_string())),
                            None => Err(Error::invalid_argument(format!(
                                "'{}' is not a valid read preference tag (which must be of the \
                                 form 'key:value')",
                                value,
                            ))),
                        })
                        .collect()
                };

                self.read_preference_tags
                    .get_or_insert_with(Vec::new)
                    .push(tags?);
            }
            "replicaset" => self.repl_set_name = Some(value.to_string()),
            k @ "retryreads" => self.retry_reads = Some(get_bool!(value, k)),
            k @ "retrywrites" => self.retry_writes = Some(get_bool!(value, k)),
            k @ "serverselectiontimeoutms" => {
                self.server_selection_timeout =
                    Some(Duration::from_millis(get_duration!(value, k)))
            }
            k @ "waitqueuetimeoutms" => {
                self.wait_queue_timeout = Some(Duration::from_millis(get_duration!(value, k)))
            }
            _ => {}
        }

        Ok(())
    }
}

fn decode(s: &str) -> Result<String> {
    percent_decode_str(s)
        .decode_utf8()
        .map(|decoded| decoded.into_owned())
        .map_err(|_| Error::invalid_argument(format!("'{}' is not valid percent-encoded UTF-8", s)))
}
