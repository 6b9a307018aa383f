//! Translation catalog for generated prose.
//!
//! All prose in digests and command replies is rendered in the list's
//! preferred language. The catalog is an explicit value handed to the
//! code that needs it for the duration of one assembly or one reply;
//! there is no process-global translator to swap in and out.

use postroom_types::Lang;

/// Phrase catalog for one language.
#[derive(Debug, Clone, Copy)]
pub struct Catalog {
    lang: Lang,
}

impl Catalog {
    pub fn new(lang: Lang) -> Self {
        Self { lang }
    }

    pub fn lang(&self) -> Lang {
        self.lang
    }

    /// `{realname} Digest, Vol {V}, Issue {I}`
    pub fn digest_id(&self, realname: &str, volume: u32, issue: u32) -> String {
        match self.lang {
            Lang::En => format!("{realname} Digest, Vol {volume}, Issue {issue}"),
            Lang::De => format!("{realname} Nachrichtensammlung, Band {volume}, Eintrag {issue}"),
            Lang::Fr => format!("Groupe {realname}, Vol {volume}, Parution {issue}"),
        }
    }

    pub fn todays_topics(&self, count: usize) -> String {
        match self.lang {
            Lang::En => format!("Today's Topics ({count} messages)"),
            Lang::De => format!("Meldungen des Tages ({count} Nachrichten)"),
            Lang::Fr => format!("Thèmes du jour ({count} messages)"),
        }
    }

    pub fn todays_topics_heading(&self) -> &'static str {
        match self.lang {
            Lang::En => "Today's Topics:",
            Lang::De => "Meldungen des Tages:",
            Lang::Fr => "Thèmes du jour :",
        }
    }

    pub fn end_of(&self, digest_id: &str) -> String {
        match self.lang {
            Lang::En => format!("End of {digest_id}"),
            Lang::De => format!("Ende {digest_id}"),
            Lang::Fr => format!("Fin de {digest_id}"),
        }
    }

    pub fn digest_header(&self) -> &'static str {
        match self.lang {
            Lang::En => "Digest Header",
            Lang::De => "Kopfzeile der Nachrichtensammlung",
            Lang::Fr => "En-tête du groupe",
        }
    }

    pub fn digest_footer(&self) -> &'static str {
        match self.lang {
            Lang::En => "Digest Footer",
            Lang::De => "Fusszeile der Nachrichtensammlung",
            Lang::Fr => "Pied de page du groupe",
        }
    }

    pub fn no_subject(&self) -> &'static str {
        match self.lang {
            Lang::En => "(no subject)",
            Lang::De => "(kein Betreff)",
            Lang::Fr => "(sans objet)",
        }
    }

    /// Digest masthead boilerplate. Placeholders: `%(real_name)s`,
    /// `%(got_list_email)s`, `%(got_request_email)s`, `%(got_owner_email)s`.
    pub fn masthead_template(&self) -> &'static str {
        match self.lang {
            Lang::En => {
                "Send %(real_name)s mailing list submissions to\n\
                 \t%(got_list_email)s\n\
                 \n\
                 To subscribe or unsubscribe via email, send a message with subject or\n\
                 body 'help' to\n\
                 \t%(got_request_email)s\n\
                 \n\
                 You can reach the person managing the list at\n\
                 \t%(got_owner_email)s\n\
                 \n\
                 When replying, please edit your Subject line so it is more specific\n\
                 than \"Re: Contents of %(real_name)s digest...\""
            }
            Lang::De => {
                "Um Nachrichten an die Liste %(real_name)s zu senden, schreiben Sie an\n\
                 \t%(got_list_email)s\n\
                 \n\
                 Um sich per E-Mail an- oder abzumelden, senden Sie eine Nachricht mit\n\
                 dem Betreff oder Text 'help' an\n\
                 \t%(got_request_email)s\n\
                 \n\
                 Den Betreuer der Liste erreichen Sie unter\n\
                 \t%(got_owner_email)s\n\
                 \n\
                 Bitte passen Sie beim Antworten die Betreffzeile an, damit sie\n\
                 aussagekräftiger ist als \"Re: Inhalt von %(real_name)s digest...\""
            }
            Lang::Fr => {
                "Envoyez vos messages pour la liste %(real_name)s à\n\
                 \t%(got_list_email)s\n\
                 \n\
                 Pour vous abonner ou vous désabonner par courriel, envoyez un message\n\
                 avec « help » dans l'objet ou dans le corps à\n\
                 \t%(got_request_email)s\n\
                 \n\
                 Vous pouvez contacter l'administrateur de la liste à l'adresse\n\
                 \t%(got_owner_email)s\n\
                 \n\
                 En répondant, merci de modifier votre ligne Objet afin qu'elle soit\n\
                 plus précise que « Re: Contenu du groupe de %(real_name)s... »"
            }
        }
    }

    pub fn results_preamble(&self) -> &'static str {
        match self.lang {
            Lang::En => {
                "The results of your email command are provided below.\n\
                 Attached is your original message."
            }
            Lang::De => {
                "Das Ergebnis Ihres E-Mail-Kommandos finden Sie unten.\n\
                 Ihre ursprüngliche Nachricht ist beigefügt."
            }
            Lang::Fr => {
                "Les résultats de vos commandes courriel sont fournis ci-dessous.\n\
                 Ci-joint votre message original."
            }
        }
    }

    pub fn results_section(&self) -> &'static str {
        match self.lang {
            Lang::En => "- Results:",
            Lang::De => "- Ergebnisse:",
            Lang::Fr => "- Résultats :",
        }
    }

    pub fn unprocessed_section(&self) -> &'static str {
        match self.lang {
            Lang::En => "\n- Unprocessed:",
            Lang::De => "\n- Unbearbeitet:",
            Lang::Fr => "\n- Non traité :",
        }
    }

    pub fn ignored_section(&self) -> &'static str {
        match self.lang {
            Lang::En => "\n- Ignored:",
            Lang::De => "\n- Ignoriert:",
            Lang::Fr => "\n- Ignoré :",
        }
    }

    pub fn done(&self) -> &'static str {
        match self.lang {
            Lang::En => "\n- Done.\n",
            Lang::De => "\n- Fertig.\n",
            Lang::Fr => "\n- Fait.\n",
        }
    }

    pub fn command_results_subject(&self) -> &'static str {
        match self.lang {
            Lang::En => "The results of your email commands",
            Lang::De => "Die Ergebnisse Ihrer E-Mail-Kommandos",
            Lang::Fr => "Les résultats de vos commandes courriel",
        }
    }

    pub fn ignoring_non_text(&self) -> &'static str {
        match self.lang {
            Lang::En => "Ignoring non-text/plain MIME parts",
            Lang::De => "MIME-Teile, die nicht text/plain sind, werden ignoriert",
            Lang::Fr => "Les parties MIME autres que text/plain sont ignorées",
        }
    }

    /// Localised `Re:` prefixes tolerated on Subject-line commands.
    pub fn re_prefixes(&self) -> &'static [&'static str] {
        match self.lang {
            Lang::En => &["re:"],
            Lang::De => &["re:", "aw:"],
            Lang::Fr => &["re:", "ré:"],
        }
    }
}

/// Interpolate `%(key)s` placeholders from `pairs`. Unknown placeholders
/// are left as-is rather than erased, so a template typo stays visible.
pub fn interpolate(template: &str, pairs: &[(&str, &str)]) -> String {
    let mut out = template.to_string();
    for (key, value) in pairs {
        out = out.replace(&format!("%({key})s"), value);
    }
    out
}
