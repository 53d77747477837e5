use bytes::{Buf, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use crate::{Error, Header, Message};

#[derive(Debug, Default)]
enum State {
    #[default]
    Header,
    Payload(Header),
}

/// Stream codec for control messages: a fixed header followed by `size` attribute bytes.
#[derive(Debug, Default)]
pub struct Codec {
    /// The current state of the decoder.
    state: State,
}

impl Codec {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Decoder for Codec {
    type Item = Message;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        loop {
            match self.state {
                State::Header => {
                    let Some(header) = Header::decode(src) else {
                        return Ok(None);
                    };
                    src.advance(Header::len());

                    self.state = State::Payload(header);
                }
                State::Payload(header) => {
                    if src.len() < header.payload_size() {
                        src.reserve(header.payload_size() - src.len());
                        return Ok(None);
                    }

                    let payload = src.split_to(header.payload_size()).freeze();
                    self.state = State::Header;

                    return Message::decode(header, payload).map(Some);
                }
            }
        }
    }
}

impl Encoder<Message> for Codec {
    type Error = Error;

    fn encode(&mut self, item: Message, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(item.raw());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use futures::{SinkExt, StreamExt};
    use tokio_util::codec::{FramedRead, FramedWrite};

    use super::*;
    use crate::{tlv::node, MessageBuilder, MessageFlags, MessageType};

    #[tokio::test]
    async fn framed_stream_yields_messages_in_order() {
        let (client, server) = tokio::io::duplex(64);
        let mut writer = FramedWrite::new(client, Codec::new());
        let mut reader = FramedRead::new(server, Codec::new());

        let first = MessageBuilder::new(MessageType::Node)
            .flags(MessageFlags::ADD)
            .u32(node::NUMBER, 1)
            .string(node::NAME, "a-rather-long-node-name-that-spans-reads")
            .build()
            .unwrap();
        let second = MessageBuilder::new(MessageType::Node)
            .flags(MessageFlags::DELETE)
            .u32(node::NUMBER, 1)
            .build()
            .unwrap();

        let (a, b) = (first.clone(), second.clone());
        tokio::spawn(async move {
            writer.send(a).await.unwrap();
            writer.send(b).await.unwrap();
        });

        assert_eq!(reader.next().await.unwrap().unwrap(), first);
        assert_eq!(reader.next().await.unwrap().unwrap(), second);
        assert!(reader.next().await.is_none());
    }

    #[test]
    fn partial_header_waits_for_more() {
        let mut codec = Codec::new();
        let mut buf = BytesMut::from(&[0x01u8, 0x00][..]);
        assert!(codec.decode(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 2);
    }
}
