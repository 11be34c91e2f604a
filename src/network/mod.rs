//! Сетевая подсистема голосовой сессии
//!
//! Содержит модули для:
//! - UDP сокета, подключённого к голосовому серверу
//! - Очереди исходящих датаграмм и циклов приёма/отправки
//! - Рукопожатия: логин, обнаружение внешнего адреса, выбор протокола

pub mod handshake;
pub mod queue;
pub mod transport;
pub mod udp;

pub use handshake::{Handshake, HandshakeState};
pub use queue::SendQueue;
pub use transport::{DatagramTransport, TransportStats};
pub use udp::{create_connected_socket, create_socket, UdpSocket};
