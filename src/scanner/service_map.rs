use std::collections::HashMap;
use std::sync::OnceLock;

const WELL_KNOWN_PORTS: &[(u16, &str)] = &[
    (20, "ftp-data"),
    (21, "ftp"),
    (22, "ssh"),
    (23, "telnet"),
    (25, "smtp"),
    (53, "dns"),
    (67, "dhcp"),
    (68, "dhcp"),
    (69, "tftp"),
    (80, "http"),
    (110, "pop3"),
    (111, "rpcbind"),
    (123, "ntp"),
    (135, "msrpc"),
    (137, "netbios-ns"),
    (138, "netbios-dgm"),
    (139, "netbios-ssn"),
    (143, "imap"),
    (161, "snmp"),
    (162, "snmptrap"),
    (389, "ldap"),
    (443, "https"),
    (445, "microsoft-ds"),
    (465, "smtps"),
    (514, "syslog"),
    (515, "printer"),
    (587, "submission"),
    (636, "ldaps"),
    (873, "rsync"),
    (993, "imaps"),
    (995, "pop3s"),
    (1080, "socks"),
    (1433, "mssql"),
    (1434, "mssql-m"),
    (1521, "oracle"),
    (1723, "pptp"),
    (2049, "nfs"),
    (2082, "cpanel"),
    (2083, "cpanel-ssl"),
    (2181, "zookeeper"),
    (3306, "mysql"),
    (3389, "ms-wbt-server"),
    (4369, "epmd"),
    (5432, "postgresql"),
    (5672, "amqp"),
    (5900, "vnc"),
    (5984, "couchdb"),
    (6379, "redis"),
    (6667, "irc"),
    (8000, "http-alt"),
    (8080, "http-proxy"),
    (8443, "https-alt"),
    (8888, "http-alt"),
    (9000, "cslistener"),
    (9090, "zeus-admin"),
    (9200, "elasticsearch"),
    (9300, "elasticsearch"),
    (11211, "memcached"),
    (27017, "mongodb"),
    (27018, "mongodb"),
    (28017, "mongodb-web"),
];

const HTTP_PORTS: &[u16] = &[80, 443, 3000, 5000, 8000, 8080, 8443, 8888, 9000, 9090];

static SERVICES: OnceLock<HashMap<u16, &'static str>> = OnceLock::new();

fn services() -> &'static HashMap<u16, &'static str> {
    SERVICES.get_or_init(|| WELL_KNOWN_PORTS.iter().copied().collect())
}

pub fn get_service_name(port: u16) -> Option<&'static str> {
    services().get(&port).copied()
}

pub fn looks_like_http(port: u16) -> bool {
    HTTP_PORTS.contains(&port)
}
