//! Implementation of SMTP commands

use crate::smtp::error::{SmtpError, SmtpLimits};
use crate::smtp::response::SmtpResponse;
use crate::smtp::session::{MailOptions, RcptOptions, Session};
use crate::smtp::state::{ProtocolState, SmtpState};

/// Handles SMTP commands and returns appropriate responses.
///
/// Everything except the DATA body goes through here; the server streams the
/// body itself once this has answered `354`.
#[derive(Debug)]
pub struct SmtpCommandHandler<'a> {
    hostname: &'a str,
    max_message_bytes: usize,
}

impl<'a> SmtpCommandHandler<'a> {
    /// Create a new command handler
    pub fn new(hostname: &'a str, max_message_bytes: usize) -> Self {
        Self {
            hostname,
            max_message_bytes,
        }
    }

    /// Process a command line and return a response
    pub fn process_command<S: Session + ?Sized>(
        &self,
        command_line: &str,
        state: &mut ProtocolState,
        session: &mut S,
    ) -> Result<SmtpResponse, SmtpError> {
        // Check command line length
        if command_line.len() > SmtpLimits::COMMAND_LINE_MAX_LENGTH {
            return Err(SmtpError::LineTooLong {
                max: SmtpLimits::COMMAND_LINE_MAX_LENGTH,
            });
        }

        let parts: Vec<&str> = command_line.split_whitespace().collect();
        if parts.is_empty() {
            return Err(SmtpError::InvalidCommand);
        }

        let cmd = parts[0].to_uppercase();

        match cmd.as_str() {
            "HELO" => self.handle_helo(parts, state, session, false),
            "EHLO" => self.handle_helo(parts, state, session, true),
            "MAIL" => self.handle_mail(parts, state, session),
            "RCPT" => self.handle_rcpt(parts, state, session),
            "DATA" => self.handle_data(parts, state),
            "RSET" => self.handle_rset(state, session),
            "NOOP" => self.handle_noop(),
            "QUIT" => self.handle_quit(state, session),
            _ => Err(SmtpError::InvalidCommand),
        }
    }

    /// Handle HELO and EHLO commands
    fn handle_helo<S: Session + ?Sized>(
        &self,
        parts: Vec<&str>,
        state: &mut ProtocolState,
        session: &mut S,
        extended: bool,
    ) -> Result<SmtpResponse, SmtpError> {
        if parts.len() < 2 {
            return Err(SmtpError::InvalidSyntax(format!(
                "{} requires domain argument",
                parts[0].to_uppercase()
            )));
        }

        let client_domain = parts[1].to_string();
        if client_domain.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
            return Err(SmtpError::DomainTooLong {
                max: SmtpLimits::DOMAIN_MAX_LENGTH,
            });
        }

        // A new greeting aborts any open transaction
        if state.state != SmtpState::Initial {
            session.reset();
        }
        state.greet(client_domain.clone(), extended);

        if extended {
            Ok(SmtpResponse::ehlo(
                self.hostname,
                &client_domain,
                self.max_message_bytes,
            ))
        } else {
            Ok(SmtpResponse::helo(self.hostname, &client_domain))
        }
    }

    /// Handle MAIL command
    fn handle_mail<S: Session + ?Sized>(
        &self,
        parts: Vec<&str>,
        state: &mut ProtocolState,
        session: &mut S,
    ) -> Result<SmtpResponse, SmtpError> {
        if !state.can_execute_command("MAIL") {
            return Err(SmtpError::InvalidState(
                "MAIL command requires HELO first".to_string(),
            ));
        }

        let (addr, params) = parse_path(&parts, "FROM:")?;
        if !addr.is_empty() {
            // Empty is the null reverse-path used by bounces
            self.validate_email_address(addr)?;
        }

        let options = MailOptions::parse(&params)?;
        if let Some(size) = options.size {
            if size > self.max_message_bytes {
                return Err(SmtpError::TooMuchData {
                    max: self.max_message_bytes,
                });
            }
        }

        session.mail(addr, &options)?;
        state.mail_accepted();

        Ok(SmtpResponse::ok())
    }

    /// Handle RCPT command
    fn handle_rcpt<S: Session + ?Sized>(
        &self,
        parts: Vec<&str>,
        state: &mut ProtocolState,
        session: &mut S,
    ) -> Result<SmtpResponse, SmtpError> {
        if !state.can_execute_command("RCPT") {
            return Err(SmtpError::InvalidState(
                "RCPT command requires MAIL first".to_string(),
            ));
        }

        let (addr, params) = parse_path(&parts, "TO:")?;
        if addr.is_empty() {
            return Err(SmtpError::InvalidSyntax(
                "TO address cannot be empty".to_string(),
            ));
        }

        // Validate email address components
        self.validate_email_address(addr)?;
        state.check_recipient_limit()?;

        session.rcpt(addr, &RcptOptions::parse(&params))?;
        state.recipient_accepted();

        Ok(SmtpResponse::ok())
    }

    /// Handle DATA command
    fn handle_data(
        &self,
        parts: Vec<&str>,
        state: &mut ProtocolState,
    ) -> Result<SmtpResponse, SmtpError> {
        if !state.can_execute_command("DATA") {
            return Err(SmtpError::InvalidState(
                "DATA command requires RCPT first".to_string(),
            ));
        }

        if parts.len() > 1 {
            return Err(SmtpError::InvalidSyntax(
                "DATA command takes no arguments".to_string(),
            ));
        }

        state.start_data();

        Ok(SmtpResponse::data_start())
    }

    /// Handle RSET command
    fn handle_rset<S: Session + ?Sized>(
        &self,
        state: &mut ProtocolState,
        session: &mut S,
    ) -> Result<SmtpResponse, SmtpError> {
        if !state.can_execute_command("RSET") {
            return Err(SmtpError::InvalidState(
                "RSET command requires HELO first".to_string(),
            ));
        }

        session.reset();
        state.reset();
        Ok(SmtpResponse::ok())
    }

    /// Handle NOOP command
    fn handle_noop(&self) -> Result<SmtpResponse, SmtpError> {
        Ok(SmtpResponse::ok())
    }

    /// Handle QUIT command; the session's logout outcome decides the reply
    fn handle_quit<S: Session + ?Sized>(
        &self,
        state: &mut ProtocolState,
        session: &mut S,
    ) -> Result<SmtpResponse, SmtpError> {
        state.close();
        session.logout()?;
        Ok(SmtpResponse::quit())
    }

    /// Validate email address format and size limits
    fn validate_email_address(&self, addr: &str) -> Result<(), SmtpError> {
        if addr.len() > SmtpLimits::PATH_MAX_LENGTH {
            return Err(SmtpError::PathTooLong {
                max: SmtpLimits::PATH_MAX_LENGTH,
            });
        }

        // Check for @ symbol
        if let Some(at_pos) = addr.rfind('@') {
            let user_part = &addr[..at_pos];
            let domain_part = &addr[at_pos + 1..];

            // Check user part length
            if user_part.len() > SmtpLimits::USER_MAX_LENGTH {
                return Err(SmtpError::UserTooLong {
                    max: SmtpLimits::USER_MAX_LENGTH,
                });
            }

            // Check domain part length
            if domain_part.len() > SmtpLimits::DOMAIN_MAX_LENGTH {
                return Err(SmtpError::DomainTooLong {
                    max: SmtpLimits::DOMAIN_MAX_LENGTH,
                });
            }

            // Basic validation - must have user and domain parts
            if user_part.is_empty() || domain_part.is_empty() {
                return Err(SmtpError::InvalidSyntax(
                    "Invalid email address format".to_string(),
                ));
            }
        } else {
            return Err(SmtpError::InvalidSyntax(
                "Email address must contain @ symbol".to_string(),
            ));
        }

        Ok(())
    }
}

/// Split `MAIL FROM:<addr> PARAMS` / `RCPT TO:<addr> PARAMS` into the bare
/// address and its ESMTP parameters.
///
/// Accepts a space after the colon (`FROM: <addr>`), which some clients send.
fn parse_path<'p>(parts: &[&'p str], keyword: &str) -> Result<(&'p str, Vec<&'p str>), SmtpError> {
    let verb = parts[0].to_uppercase();
    let usage = || {
        SmtpError::InvalidSyntax(format!(
            "{verb} command must be '{verb} {keyword}<address>'"
        ))
    };

    let first: &'p str = parts.get(1).copied().ok_or_else(usage)?;
    if !first
        .get(..keyword.len())
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(keyword))
    {
        return Err(usage());
    }

    let mut rest = parts[2..].iter().copied();
    let path = match &first[keyword.len()..] {
        "" => rest.next().ok_or_else(usage)?,
        inline => inline,
    };

    let addr = path
        .strip_prefix('<')
        .and_then(|path| path.strip_suffix('>'))
        .ok_or_else(|| {
            SmtpError::InvalidSyntax(format!(
                "{} address must be enclosed in angle brackets",
                keyword.trim_end_matches(':')
            ))
        })?;

    Ok((addr, rest.collect()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Read;

    /// Records the callbacks it receives
    #[derive(Default)]
    struct RecordingSession {
        from: Option<String>,
        to: Vec<String>,
        resets: usize,
        logouts: usize,
        fail_logout: bool,
    }

    impl Session for RecordingSession {
        fn mail(&mut self, from: &str, _options: &MailOptions) -> Result<(), SmtpError> {
            self.from = Some(from.to_string());
            self.to.clear();
            Ok(())
        }

        fn rcpt(&mut self, to: &str, _options: &RcptOptions) -> Result<(), SmtpError> {
            self.to.push(to.to_string());
            Ok(())
        }

        fn data(&mut self, source: &mut dyn Read) -> Result<(), SmtpError> {
            let mut sink = Vec::new();
            source.read_to_end(&mut sink).map_err(SmtpError::DataRead)?;
            Ok(())
        }

        fn reset(&mut self) {
            self.resets += 1;
            self.from = None;
            self.to.clear();
        }

        fn logout(&mut self) -> Result<(), SmtpError> {
            self.logouts += 1;
            if self.fail_logout {
                return Err(SmtpError::InvalidState("upstream down".to_string()));
            }
            Ok(())
        }
    }

    fn create_handler<'a>() -> SmtpCommandHandler<'a> {
        SmtpCommandHandler::new("test.local", 1000)
    }

    fn greeted() -> (ProtocolState, RecordingSession) {
        let handler = create_handler();
        let mut state = ProtocolState::new(100);
        let mut session = RecordingSession::default();
        handler
            .process_command("HELO client.local", &mut state, &mut session)
            .unwrap();
        (state, session)
    }

    #[test]
    fn test_helo_command() {
        let handler = create_handler();
        let mut state = ProtocolState::new(100);
        let mut session = RecordingSession::default();

        let response = handler
            .process_command("HELO client.local", &mut state, &mut session)
            .unwrap();

        assert_eq!(response.code, "250");
        assert_eq!(response.message, "test.local Hello client.local");
        assert_eq!(state.client_domain, Some("client.local".to_string()));
        assert_eq!(session.resets, 0);
    }

    #[test]
    fn test_ehlo_advertises_size() {
        let handler = create_handler();
        let mut state = ProtocolState::new(100);
        let mut session = RecordingSession::default();

        let response = handler
            .process_command("EHLO client.local", &mut state, &mut session)
            .unwrap();

        assert!(state.extended);
        assert!(response.format().contains("250 SIZE 1000\r\n"));
    }

    #[test]
    fn test_helo_missing_domain() {
        let handler = create_handler();
        let mut state = ProtocolState::new(100);
        let mut session = RecordingSession::default();

        let result = handler.process_command("HELO", &mut state, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));
    }

    #[test]
    fn test_second_helo_resets_session() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut state, &mut session)
            .unwrap();

        handler
            .process_command("EHLO other.local", &mut state, &mut session)
            .unwrap();

        assert_eq!(session.resets, 1);
        assert!(session.from.is_none());
        assert_eq!(state.state, SmtpState::GreetingReceived);
    }

    #[test]
    fn test_mail_command() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();

        let response = handler
            .process_command("MAIL FROM:<sender@example.com>", &mut state, &mut session)
            .unwrap();

        assert_eq!(response.code, "250");
        assert_eq!(session.from, Some("sender@example.com".to_string()));
        assert_eq!(state.state, SmtpState::MailReceived);
    }

    #[test]
    fn test_mail_with_params_and_space() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();

        handler
            .process_command(
                "mail from: <sender@example.com> BODY=8BITMIME SIZE=10",
                &mut state,
                &mut session,
            )
            .unwrap();

        assert_eq!(session.from, Some("sender@example.com".to_string()));
    }

    #[test]
    fn test_mail_declared_size_too_large() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();

        let result = handler.process_command(
            "MAIL FROM:<sender@example.com> SIZE=5000",
            &mut state,
            &mut session,
        );
        assert!(matches!(result, Err(SmtpError::TooMuchData { max: 1000 })));
        assert!(session.from.is_none());
    }

    #[test]
    fn test_null_reverse_path() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();

        handler
            .process_command("MAIL FROM:<>", &mut state, &mut session)
            .unwrap();
        assert_eq!(session.from, Some(String::new()));
    }

    #[test]
    fn test_mail_without_helo() {
        let handler = create_handler();
        let mut state = ProtocolState::new(100);
        let mut session = RecordingSession::default();

        let result =
            handler.process_command("MAIL FROM:<sender@example.com>", &mut state, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidState(_))));
    }

    #[test]
    fn test_mail_invalid_syntax() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();

        let result = handler.process_command("MAIL sender@example.com", &mut state, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));

        let result =
            handler.process_command("MAIL FROM:sender@example.com", &mut state, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));
    }

    #[test]
    fn test_rcpt_command() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut state, &mut session)
            .unwrap();

        let response = handler
            .process_command("RCPT TO:<recipient@example.com>", &mut state, &mut session)
            .unwrap();

        assert_eq!(response.code, "250");
        assert_eq!(session.to, vec!["recipient@example.com".to_string()]);
        assert_eq!(state.recipients, 1);
    }

    #[test]
    fn test_rcpt_without_mail() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();

        let result =
            handler.process_command("RCPT TO:<recipient@example.com>", &mut state, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidState(_))));
        assert!(session.to.is_empty());
    }

    #[test]
    fn test_rcpt_limit() {
        let handler = create_handler();
        let mut state = ProtocolState::new(1);
        let mut session = RecordingSession::default();
        handler
            .process_command("HELO client.local", &mut state, &mut session)
            .unwrap();
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut state, &mut session)
            .unwrap();
        handler
            .process_command("RCPT TO:<one@example.com>", &mut state, &mut session)
            .unwrap();

        let result = handler.process_command("RCPT TO:<two@example.com>", &mut state, &mut session);
        assert!(matches!(result, Err(SmtpError::TooManyRecipients { max: 1 })));
        assert_eq!(session.to.len(), 1);
    }

    #[test]
    fn test_data_command() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut state, &mut session)
            .unwrap();
        handler
            .process_command("RCPT TO:<recipient@example.com>", &mut state, &mut session)
            .unwrap();

        let response = handler
            .process_command("DATA", &mut state, &mut session)
            .unwrap();

        assert_eq!(response.code, "354");
        assert_eq!(state.state, SmtpState::DataMode);
    }

    #[test]
    fn test_data_without_rcpt() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut state, &mut session)
            .unwrap();

        let result = handler.process_command("DATA", &mut state, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidState(_))));
    }

    #[test]
    fn test_rset_command() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut state, &mut session)
            .unwrap();
        handler
            .process_command("RCPT TO:<recipient@example.com>", &mut state, &mut session)
            .unwrap();

        let response = handler
            .process_command("RSET", &mut state, &mut session)
            .unwrap();

        assert_eq!(response.code, "250");
        assert_eq!(session.resets, 1);
        assert!(session.from.is_none());
        assert_eq!(state.state, SmtpState::GreetingReceived);
        assert_eq!(state.recipients, 0);
    }

    #[test]
    fn test_noop_command() {
        let handler = create_handler();
        let mut state = ProtocolState::new(100);
        let mut session = RecordingSession::default();

        let response = handler
            .process_command("NOOP", &mut state, &mut session)
            .unwrap();
        assert_eq!(response.code, "250");
    }

    #[test]
    fn test_quit_command() {
        let handler = create_handler();
        let mut state = ProtocolState::new(100);
        let mut session = RecordingSession::default();

        let response = handler
            .process_command("QUIT", &mut state, &mut session)
            .unwrap();
        assert_eq!(response.code, "221");
        assert_eq!(session.logouts, 1);
        assert!(state.is_closing());
    }

    #[test]
    fn test_quit_reports_logout_failure() {
        let handler = create_handler();
        let mut state = ProtocolState::new(100);
        let mut session = RecordingSession {
            fail_logout: true,
            ..Default::default()
        };

        let result = handler.process_command("QUIT", &mut state, &mut session);
        assert!(result.is_err());
        assert!(state.is_closing());
    }

    #[test]
    fn test_invalid_command() {
        let handler = create_handler();
        let mut state = ProtocolState::new(100);
        let mut session = RecordingSession::default();

        let result = handler.process_command("INVALID", &mut state, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidCommand)));
    }

    #[test]
    fn test_command_line_too_long() {
        let handler = create_handler();
        let mut state = ProtocolState::new(100);
        let mut session = RecordingSession::default();

        let long_command = "HELO ".to_string() + &"a".repeat(SmtpLimits::COMMAND_LINE_MAX_LENGTH);
        let result = handler.process_command(&long_command, &mut state, &mut session);
        assert!(matches!(result, Err(SmtpError::LineTooLong { .. })));
    }

    #[test]
    fn test_validate_email_address() {
        let handler = create_handler();

        // Valid addresses
        assert!(handler.validate_email_address("user@example.com").is_ok());
        assert!(handler.validate_email_address("test@test.local").is_ok());

        // Invalid addresses
        assert!(handler.validate_email_address("invalid").is_err());
        assert!(handler.validate_email_address("@example.com").is_err());
        assert!(handler.validate_email_address("user@").is_err());

        // Too long user part
        let long_user = "a".repeat(SmtpLimits::USER_MAX_LENGTH + 1) + "@example.com";
        assert!(matches!(
            handler.validate_email_address(&long_user),
            Err(SmtpError::UserTooLong { .. })
        ));

        // Too long domain part
        let long_domain = "user@".to_string() + &"a".repeat(SmtpLimits::DOMAIN_MAX_LENGTH + 1);
        assert!(matches!(
            handler.validate_email_address(&long_domain),
            Err(SmtpError::DomainTooLong { .. })
        ));

        // Too long path
        let long_path = "user@".to_string() + &"a".repeat(SmtpLimits::PATH_MAX_LENGTH);
        assert!(matches!(
            handler.validate_email_address(&long_path),
            Err(SmtpError::PathTooLong { .. })
        ));
    }

    #[test]
    fn test_empty_recipient_rejected() {
        let handler = create_handler();
        let (mut state, mut session) = greeted();
        handler
            .process_command("MAIL FROM:<sender@example.com>", &mut state, &mut session)
            .unwrap();

        let result = handler.process_command("RCPT TO:<>", &mut state, &mut session);
        assert!(matches!(result, Err(SmtpError::InvalidSyntax(_))));
    }
}
