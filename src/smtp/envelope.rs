use mailparse::MailAddrList;

/// The sender and recipients accumulated for the message in flight.
///
/// Cleared on RSET, on HELO/EHLO, and once a message completes.
#[derive(Default, Debug)]
pub struct Envelope {
    sender: Option<MailAddrList>,
    recipients: Option<MailAddrList>,
}

impl Envelope {
    /// Returns a reference to the sender for this message
    #[inline]
    pub const fn sender(&self) -> &Option<MailAddrList> {
        &self.sender
    }

    /// Returns a mutable reference to the sender for this message
    #[inline]
    pub fn sender_mut(&mut self) -> &mut Option<MailAddrList> {
        &mut self.sender
    }

    /// Returns a reference to the recipients for this message
    #[inline]
    pub const fn recipients(&self) -> &Option<MailAddrList> {
        &self.recipients
    }

    /// Returns a mutable reference to the recipients for this message
    #[inline]
    pub fn recipients_mut(&mut self) -> &mut Option<MailAddrList> {
        &mut self.recipients
    }

    pub fn clear(&mut self) {
        self.sender = None;
        self.recipients = None;
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.sender.is_none() && self.recipients.is_none()
    }
}
